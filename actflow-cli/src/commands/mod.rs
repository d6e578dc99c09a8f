pub mod matrix;
pub mod run;
pub mod validate;

use color_eyre::eyre::bail;
use color_eyre::Result;
use indexmap::IndexMap;

/// Parse repeated `NAME=VALUE` flags
pub fn parse_pairs(flag: &str, values: &[String]) -> Result<IndexMap<String, String>> {
    let mut pairs = IndexMap::new();
    for value in values {
        match value.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                pairs.insert(name.trim().to_string(), value.to_string());
            }
            _ => bail!("Invalid {} '{}'. Expected NAME=VALUE", flag, value),
        }
    }
    Ok(pairs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pairs() {
        let pairs = parse_pairs("--var", &["A=1".to_string(), "B=x=y".to_string()]).unwrap();
        assert_eq!(pairs["A"], "1");
        assert_eq!(pairs["B"], "x=y");
        assert!(parse_pairs("--var", &["novalue".to_string()]).is_err());
        assert!(parse_pairs("--var", &["=1".to_string()]).is_err());
    }
}
