//! The sim's expression language, used by `evaluate` and `wait_for_condition`.
//!
//! ```text
//! expr     := operand [op operand]
//! operand  := "exists(" path ")" | [path] ":" property | json-literal
//! property := name ["." ("x" | "y" | index)]
//! op       := "==" | "!=" | "<=" | ">=" | "<" | ">"
//! ```
//!
//! `:prop` with no path reads from the request's target node.

use std::cmp::Ordering;

use serde_json::Value;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExprError {
    #[error("empty expression")]
    Empty,

    #[error("cannot parse '{0}'")]
    Syntax(String),

    #[error("'{0}' is relative but no target was given")]
    NoTarget(String),

    #[error("cannot compare {lhs} and {rhs}")]
    Incomparable { lhs: Value, rhs: Value },

    #[error("{0} has no element {1}")]
    NoElement(String, usize),
}

/// Read access to host state for evaluation.
pub trait Resolve {
    fn exists(&self, path: &str) -> bool;
    fn property(&self, path: &str, property: &str) -> Result<Value, marionette::HostError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    const ALL: [(&'static str, Op); 6] = [
        ("==", Op::Eq),
        ("!=", Op::Ne),
        ("<=", Op::Le),
        (">=", Op::Ge),
        ("<", Op::Lt),
        (">", Op::Gt),
    ];
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Literal(Value),
    Exists(String),
    Property {
        path: Option<String>,
        property: String,
        index: Option<usize>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    lhs: Operand,
    rhs: Option<(Op, Operand)>,
}

/// Position and operator of the first top-level comparison.
fn find_op(text: &str) -> Option<(usize, &'static str, Op)> {
    let bytes = text.as_bytes();
    let mut depth = 0i32;
    let mut in_string = false;
    let mut escaped = false;
    for (i, &b) in bytes.iter().enumerate() {
        if in_string {
            match b {
                _ if escaped => escaped = false,
                b'\\' => escaped = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'[' | b'{' | b'(' => depth += 1,
            b']' | b'}' | b')' => depth -= 1,
            _ if depth == 0 && text.is_char_boundary(i) => {
                for (token, op) in Op::ALL {
                    if text[i..].starts_with(token) {
                        return Some((i, token, op));
                    }
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_operand(text: &str) -> Result<Operand, ExprError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ExprError::Empty);
    }
    if let Some(inner) = text.strip_prefix("exists(").and_then(|t| t.strip_suffix(')')) {
        return Ok(Operand::Exists(inner.trim().to_string()));
    }
    if text.starts_with('/') || text.starts_with(':') {
        let (path, property) = text
            .rsplit_once(':')
            .ok_or_else(|| ExprError::Syntax(text.to_string()))?;
        let (property, index) = match property.split_once('.') {
            Some((name, "x")) => (name, Some(0)),
            Some((name, "y")) => (name, Some(1)),
            Some((name, n)) => (
                name,
                Some(n.parse().map_err(|_| ExprError::Syntax(text.to_string()))?),
            ),
            None => (property, None),
        };
        if property.is_empty() {
            return Err(ExprError::Syntax(text.to_string()));
        }
        return Ok(Operand::Property {
            path: (!path.is_empty()).then(|| path.to_string()),
            property: property.to_string(),
            index,
        });
    }
    serde_json::from_str(text)
        .map(Operand::Literal)
        .map_err(|_| ExprError::Syntax(text.to_string()))
}

fn compare(op: Op, lhs: &Value, rhs: &Value) -> Result<bool, ExprError> {
    let ordering = match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(f64::NAN), b.as_f64().unwrap_or(f64::NAN));
            if matches!(op, Op::Eq | Op::Ne) {
                let equal = (a - b).abs() < 1e-9;
                return Ok(equal == (op == Op::Eq));
            }
            a.partial_cmp(&b)
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    };
    match (op, ordering) {
        (Op::Eq, _) => Ok(lhs == rhs),
        (Op::Ne, _) => Ok(lhs != rhs),
        (Op::Lt, Some(o)) => Ok(o == Ordering::Less),
        (Op::Le, Some(o)) => Ok(o != Ordering::Greater),
        (Op::Gt, Some(o)) => Ok(o == Ordering::Greater),
        (Op::Ge, Some(o)) => Ok(o != Ordering::Less),
        (_, None) => Err(ExprError::Incomparable {
            lhs: lhs.clone(),
            rhs: rhs.clone(),
        }),
    }
}

impl Expr {
    pub fn parse(text: &str) -> Result<Self, ExprError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ExprError::Empty);
        }
        match find_op(text) {
            Some((at, token, op)) => Ok(Self {
                lhs: parse_operand(&text[..at])?,
                rhs: Some((op, parse_operand(&text[at + token.len()..])?)),
            }),
            None => Ok(Self {
                lhs: parse_operand(text)?,
                rhs: None,
            }),
        }
    }

    pub fn eval(&self, scene: &dyn Resolve, target: Option<&str>) -> Result<Value, marionette::HostError> {
        let lhs = Self::operand(&self.lhs, scene, target)?;
        let Some((op, rhs)) = &self.rhs else {
            return Ok(lhs);
        };
        let rhs = Self::operand(rhs, scene, target)?;
        compare(*op, &lhs, &rhs)
            .map(Value::Bool)
            .map_err(|e| marionette::HostError::Evaluation(e.to_string()))
    }

    fn operand(
        operand: &Operand,
        scene: &dyn Resolve,
        target: Option<&str>,
    ) -> Result<Value, marionette::HostError> {
        match operand {
            Operand::Literal(value) => Ok(value.clone()),
            Operand::Exists(path) => Ok(Value::Bool(scene.exists(path))),
            Operand::Property {
                path,
                property,
                index,
            } => {
                let path = match (path.as_deref(), target) {
                    (Some(path), _) | (None, Some(path)) => path,
                    (None, None) => {
                        return Err(marionette::HostError::Evaluation(
                            ExprError::NoTarget(format!(":{}", property)).to_string(),
                        ));
                    }
                };
                let value = scene.property(path, property)?;
                match index {
                    None => Ok(value),
                    Some(i) => value.get(*i).cloned().ok_or_else(|| {
                        marionette::HostError::Evaluation(
                            ExprError::NoElement(format!("{}:{}", path, property), *i).to_string(),
                        )
                    }),
                }
            }
        }
    }
}
