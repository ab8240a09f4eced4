use std::collections::BTreeMap;

use prost_types::value::Kind;
use prost_types::value::Kind::StringValue;
use prost_types::{ListValue, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::apiv1::rpc::BatchStatement;

/// A Statement is a SQL query with named parameters.
///
/// A parameter placeholder consists of '@' followed by the parameter name.
/// Parameters may appear anywhere that a literal value is expected. The same
/// parameter name may be used more than once. It is an error to execute a
/// statement with unbound parameters. On the other hand, it is allowable to
/// bind parameter names that are not used.
#[derive(Clone, Debug, PartialEq)]
pub struct Statement {
    pub(crate) sql: String,
    pub(crate) params: BTreeMap<String, Value>,
}

impl Statement {
    /// new returns a Statement with the given SQL and an empty Params map.
    pub fn new<T: Into<String>>(sql: T) -> Self {
        Statement {
            sql: sql.into(),
            params: Default::default(),
        }
    }

    /// add_params add the bind parameter.
    /// Implement the ToKind trait to use non-predefined types.
    pub fn add_param<T>(&mut self, name: &str, value: &T)
    where
        T: ToKind + ?Sized,
    {
        self.params.insert(
            name.to_string(),
            Value {
                kind: Some(value.to_kind()),
            },
        );
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }
}

impl From<Statement> for BatchStatement {
    fn from(stmt: Statement) -> Self {
        BatchStatement {
            sql: stmt.sql,
            params: stmt.params,
        }
    }
}

pub trait ToKind {
    fn to_kind(&self) -> Kind;
}

impl ToKind for String {
    fn to_kind(&self) -> Kind {
        StringValue(self.clone())
    }
}

impl ToKind for &str {
    fn to_kind(&self) -> Kind {
        StringValue(self.to_string())
    }
}

impl ToKind for i64 {
    fn to_kind(&self) -> Kind {
        self.to_string().to_kind()
    }
}

impl ToKind for f64 {
    fn to_kind(&self) -> Kind {
        Kind::NumberValue(*self)
    }
}

impl ToKind for bool {
    fn to_kind(&self) -> Kind {
        Kind::BoolValue(*self)
    }
}

impl ToKind for OffsetDateTime {
    fn to_kind(&self) -> Kind {
        match self.format(&Rfc3339) {
            Ok(s) => s.to_kind(),
            // years outside 0..=9999 have no RFC 3339 form
            Err(_) => self.to_string().to_kind(),
        }
    }
}

impl<T> ToKind for Option<T>
where
    T: ToKind,
{
    fn to_kind(&self) -> Kind {
        match self {
            Some(vv) => vv.to_kind(),
            None => Kind::NullValue(prost_types::NullValue::NullValue.into()),
        }
    }
}

impl<T> ToKind for Vec<T>
where
    T: ToKind,
{
    fn to_kind(&self) -> Kind {
        Kind::ListValue(ListValue {
            values: self
                .iter()
                .map(|x| Value {
                    kind: Some(x.to_kind()),
                })
                .collect(),
        })
    }
}
