//! Values produced by formula evaluation

use std::fmt;

/// Value types during formula evaluation
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    Number(f64),
    Text(String),
    /// No data: a missing variable, or arithmetic over something that is not
    /// a number
    #[default]
    Undefined,
}

impl Value {
    /// Get the number, if this is one
    ///
    /// Unlike spreadsheet coercion, text is never parsed as a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Get the text, if this is text
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_number(&self) -> bool {
        matches!(self, Value::Number(_))
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n.into())
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Option<f64>> for Value {
    fn from(n: Option<f64>) -> Self {
        n.map_or(Value::Undefined, Value::Number)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{}", n),
            Value::Text(s) => f.write_str(s),
            Value::Undefined => f.write_str("#UNDEFINED"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_as_number() {
        assert_eq!(Value::Number(2.5).as_number(), Some(2.5));
        assert_eq!(Value::from("42").as_number(), None);
        assert_eq!(Value::Undefined.as_number(), None);
    }

    #[test]
    fn test_from_option() {
        assert_eq!(Value::from(Some(1.0)), Value::Number(1.0));
        assert_eq!(Value::from(None::<f64>), Value::Undefined);
    }

    #[test]
    fn test_display() {
        assert_eq!(Value::Number(42.0).to_string(), "42");
        assert_eq!(Value::Number(0.25).to_string(), "0.25");
        assert_eq!(Value::from("abc").to_string(), "abc");
        assert_eq!(Value::Undefined.to_string(), "#UNDEFINED");
    }
}
