// Built-in action runners
// Embedders register real actions; these cover stubbing and closures

use crate::error::StepError;
use crate::runners::{ActionCall, ActionRunner, StepIo};

/// Succeeds without doing anything. Used as a fallback to dry-run
/// workflows whose actions are not available locally.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAction;

#[async_trait::async_trait]
impl ActionRunner for NoopAction {
    async fn run(&self, call: &ActionCall<'_>, io: &mut StepIo) -> Result<(), StepError> {
        io.log(format!("skipping {} (no runner registered)", call.reference));
        Ok(())
    }
}

/// Adapts a synchronous closure into an action
pub struct FnAction<F>(pub F);

impl<F> FnAction<F>
where
    F: Fn(&ActionCall<'_>, &mut StepIo) -> Result<(), StepError> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self(f)
    }
}

#[async_trait::async_trait]
impl<F> ActionRunner for FnAction<F>
where
    F: Fn(&ActionCall<'_>, &mut StepIo) -> Result<(), StepError> + Send + Sync,
{
    async fn run(&self, call: &ActionCall<'_>, io: &mut StepIo) -> Result<(), StepError> {
        (self.0)(call, io)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::events::EventSink;
    use crate::execution::secrets::SecretMasker;

    use indexmap::IndexMap;
    use std::path::Path;
    use std::sync::Arc;

    fn call<'a>(
        inputs: &'a IndexMap<String, String>,
        env: &'a IndexMap<String, String>,
    ) -> ActionCall<'a> {
        ActionCall {
            reference: "acme/version@v1",
            inputs,
            env,
            working_dir: Path::new("."),
        }
    }

    #[tokio::test]
    async fn test_fn_action_sets_outputs() {
        let action = FnAction::new(|call: &ActionCall<'_>, io: &mut StepIo| {
            let prefix = call.input("prefix").unwrap_or("v");
            io.set_output("version", format!("{}1.0", prefix));
            Ok(())
        });

        let mut inputs = IndexMap::new();
        inputs.insert("prefix".to_string(), "release-".to_string());
        let env = IndexMap::new();
        let mut io = StepIo::new("job", 0, EventSink::new(None, Arc::new(SecretMasker::default())));

        action.run(&call(&inputs, &env), &mut io).await.unwrap();
        assert_eq!(io.outputs()["version"], "release-1.0");
    }

    #[tokio::test]
    async fn test_noop_action_succeeds() {
        let inputs = IndexMap::new();
        let env = IndexMap::new();
        let mut io = StepIo::new("job", 0, EventSink::new(None, Arc::new(SecretMasker::default())));
        assert!(NoopAction.run(&call(&inputs, &env), &mut io).await.is_ok());
        assert!(io.outputs().is_empty());
    }
}
