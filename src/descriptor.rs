use serde::{de, Deserialize, Serialize};
use serde_json::Value;

use crate::{Condition, DescriptorError, FilterQuery};


/// Visibility of a plain variable's state: shared across the whole session,
/// or local to one browser tab.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    #[default]
    Session,
    Tab,
}

impl Scope {
    fn is_session(&self) -> bool {
        *self == Scope::Session
    }
}

/// A server-declared reactive cell.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Variable {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Scope::is_session")]
    pub scope: Scope,
}

/// A variable computed server-side from the resolved values of its inputs.
///
/// `deps`, when present, restricts which inputs participate in the recompute
/// fingerprint; inputs outside the allowlist are still sent with the request
/// but changes to them alone do not trigger recomputation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DerivedVariable {
    pub uid: String,
    pub variables: Vec<VariableInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deps: Option<Vec<String>>,
}

/// A variable holding server-side tabular data, fetched in filtered,
/// paginated slices rather than resolved as a value.
///
/// `scope` is carried for the server; client-side fetch state lives in
/// per-resolver handles and is never shared across tabs regardless of it.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DataVariable {
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterQuery>,
    #[serde(default, skip_serializing_if = "Scope::is_session")]
    pub scope: Scope,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DerivedDataVariable {
    pub uid: String,
    pub variables: Vec<VariableInput>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deps: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterQuery>,
}

/// A variable descriptor as declared by the server, discriminated on the
/// wire by `__typename`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "__typename")]
pub enum VariableDef {
    Variable(Variable),
    DerivedVariable(DerivedVariable),
    DataVariable(DataVariable),
    DerivedDataVariable(DerivedDataVariable),
}

impl VariableDef {
    pub fn uid(&self) -> &str {
        match self {
            VariableDef::Variable(v) => &v.uid,
            VariableDef::DerivedVariable(v) => &v.uid,
            VariableDef::DataVariable(v) => &v.uid,
            VariableDef::DerivedDataVariable(v) => &v.uid,
        }
    }

    /// Decodes a wire descriptor, reporting an unknown `__typename` as a
    /// configuration error.
    pub fn from_value(value: Value) -> Result<Self, DescriptorError> {
        let typename = value
            .get("__typename")
            .and_then(Value::as_str)
            .map(str::to_string);
        serde_json::from_value(value).map_err(|e| match typename.as_deref() {
            Some(t) if !KNOWN_TYPENAMES.contains(&t) => {
                DescriptorError::UnknownTypename(t.to_string())
            }
            _ => DescriptorError::Malformed(e.to_string()),
        })
    }
}

const KNOWN_TYPENAMES: [&str; 4] = [
    "Variable",
    "DerivedVariable",
    "DataVariable",
    "DerivedDataVariable",
];

/// One input of a derived variable: a nested descriptor, a condition, or a
/// literal value.
///
/// The wire format is positional JSON with no dedicated tag, so decoding
/// disambiguates structurally: objects carrying `__typename` are
/// descriptors (an unknown `__typename` is an error, never a literal),
/// objects shaped like `{variable, operator, other}` are conditions, and
/// everything else is a literal.
#[derive(Clone, Debug, PartialEq)]
pub enum VariableInput {
    Def(Box<VariableDef>),
    Condition(Box<Condition>),
    Literal(Value),
}

impl VariableInput {
    /// The uid this input contributes to a `deps` allowlist, if any.
    /// Conditions and literals carry no uid and always participate in
    /// recompute fingerprints.
    pub fn uid(&self) -> Option<&str> {
        match self {
            VariableInput::Def(def) => Some(def.uid()),
            VariableInput::Condition(_) | VariableInput::Literal(_) => None,
        }
    }
}

impl Serialize for VariableInput {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            VariableInput::Def(def) => def.serialize(serializer),
            VariableInput::Condition(cond) => cond.serialize(serializer),
            VariableInput::Literal(value) => value.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for VariableInput {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        let keys = |k: &str| value.as_object().is_some_and(|m| m.contains_key(k));
        if keys("__typename") {
            let def = VariableDef::from_value(value).map_err(de::Error::custom)?;
            Ok(VariableInput::Def(Box::new(def)))
        } else if keys("variable") && keys("operator") && keys("other") {
            let cond = Condition::deserialize(value).map_err(de::Error::custom)?;
            Ok(VariableInput::Condition(Box::new(cond)))
        } else {
            Ok(VariableInput::Literal(value))
        }
    }
}
