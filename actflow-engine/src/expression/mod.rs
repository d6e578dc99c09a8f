// Expression Engine Module
// `${{ }}` templates, conditions and the built-in function library

pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;
pub mod value;

pub use evaluator::{
    EvalError, Evaluator, ExpressionContext, ExpressionEngine, GithubContext, JobContext,
    JobDependency, RunnerContext, StatusContext, StepContext, StrategyContext,
};
pub use functions::BuiltinFunctions;
pub use lexer::{contains_expression, extract_expressions, LexError, Lexer, TemplatePart, Token};
pub use parser::{BinaryOp, Expr, ExprParser, ParseExprError, Reference, ReferencePart, UnaryOp};
pub use value::Value;
