//! Device introspection data returned by `Describe`.
//!
//! Firmware answers with one or two JSON documents. The system document
//! describes modules and platform (`m`, `p`), the application document lists
//! functions (`f`) and variables (`v`). Older firmware sends both in one.
//!
//! ```json
//! {"f": ["digitalwrite", {"name": "setlevel", "args": [["level", "int32"]], "returns": "int32"}],
//!  "v": {"temperature": 9, "name": "string"}}
//! ```

use crate::codec::{ArgSpec, ValueType};
use crate::error::ProtocolError;
use serde_json::{Map, Value as Json};
use std::collections::HashMap;
use tracing::warn;

/// Declared shape of a device function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    pub name: String,
    pub args: Vec<ArgSpec>,
    pub returns: ValueType,
}

impl FunctionSignature {
    /// One string argument returning int32, the shape of every function on
    /// firmware that only lists names.
    pub fn legacy(name: &str) -> Self {
        Self {
            name: name.to_string(),
            args: vec![ArgSpec::new(None, ValueType::String)],
            returns: ValueType::Int32,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceFunctionState {
    /// Function names in the order the firmware listed them.
    pub functions: Vec<String>,
    /// Typed signatures keyed by lowercase function name.
    pub signatures: HashMap<String, FunctionSignature>,
    pub variables: HashMap<String, ValueType>,
    pub system: Option<Json>,
    pub application: Option<Json>,
}

impl DeviceFunctionState {
    /// Parse one `DescribeReturn` payload.
    pub fn parse(payload: &[u8]) -> Result<Self, ProtocolError> {
        let json: Json = serde_json::from_slice(payload)?;
        let Json::Object(map) = &json else {
            return Err(ProtocolError::Malformed("describe payload is not a JSON object".to_string()));
        };

        let mut state = Self::default();
        if map.contains_key("m") || map.contains_key("p") {
            state.system = Some(json.clone());
        }
        if map.contains_key("f") || map.contains_key("v") {
            state.read_functions(map);
            state.read_variables(map);
            state.application = Some(json.clone());
        }
        Ok(state)
    }

    fn read_functions(&mut self, map: &Map<String, Json>) {
        let Some(Json::Array(entries)) = map.get("f") else {
            return;
        };
        for entry in entries {
            match entry {
                Json::String(name) => self.functions.push(name.clone()),
                Json::Object(obj) => match parse_signature(obj) {
                    Some(sig) => {
                        self.functions.push(sig.name.clone());
                        self.signatures.insert(sig.name.to_lowercase(), sig);
                    }
                    None => warn!("Skipping unparseable function entry: {}", entry),
                },
                other => warn!("Skipping unexpected function entry: {}", other),
            }
        }
    }

    fn read_variables(&mut self, map: &Map<String, Json>) {
        let Some(Json::Object(vars)) = map.get("v") else {
            return;
        };
        for (name, ty) in vars {
            match ValueType::from_json(ty) {
                Some(ty) => {
                    self.variables.insert(name.clone(), ty);
                }
                None => warn!("Variable '{}' has unknown type {}", name, ty),
            }
        }
    }

    /// True once the application half lists both functions and variables.
    pub fn has_functions_and_variables(&self) -> bool {
        self.application
            .as_ref()
            .is_some_and(|app| app.get("f").is_some() && app.get("v").is_some())
    }

    /// Fold a second `DescribeReturn` into this one.
    pub fn merge(&mut self, other: DeviceFunctionState) {
        if other.system.is_some() {
            self.system = other.system;
        }
        if other.application.is_some() {
            self.functions = other.functions;
            self.signatures = other.signatures;
            self.variables = other.variables;
            self.application = other.application;
        }
    }

    pub fn variable_type(&self, name: &str) -> Option<ValueType> {
        self.variables.get(name).copied()
    }

    /// Resolve how to call `name`: the typed signature when the firmware
    /// declared one, otherwise the legacy shape if the name is listed.
    pub fn function_signature(&self, name: &str) -> Option<FunctionSignature> {
        let key = name.to_lowercase();
        if let Some(sig) = self.signatures.get(&key) {
            return Some(sig.clone());
        }
        self.functions
            .iter()
            .find(|f| f.to_lowercase() == key)
            .map(|f| FunctionSignature::legacy(f))
    }

    /// Combined JSON for API consumers.
    pub fn to_json(&self) -> Json {
        let mut out = Map::new();
        if let Some(Json::Object(system)) = &self.system {
            out.extend(system.clone());
        }
        if let Some(Json::Object(app)) = &self.application {
            out.extend(app.clone());
        }
        Json::Object(out)
    }
}

fn parse_signature(obj: &Map<String, Json>) -> Option<FunctionSignature> {
    let name = obj.get("name")?.as_str()?.to_string();
    let args = match obj.get("args") {
        Some(Json::Array(args)) => args
            .iter()
            .map(|arg| match arg {
                // ["name", "type"] or a bare type
                Json::Array(pair) if pair.len() == 2 => {
                    Some(ArgSpec::new(pair[0].as_str(), ValueType::from_json(&pair[1])?))
                }
                other => Some(ArgSpec::new(None, ValueType::from_json(other)?)),
            })
            .collect::<Option<Vec<_>>>()?,
        None => Vec::new(),
        Some(_) => return None,
    };
    let returns = match obj.get("returns") {
        Some(ty) => ValueType::from_json(ty)?,
        None => ValueType::Int32,
    };
    Some(FunctionSignature { name, args, returns })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_combined_document() {
        let state = DeviceFunctionState::parse(
            br#"{"p":6,"m":[],"f":["digitalwrite"],"v":{"temp":9,"name":"string","bad":99}}"#,
        )
        .unwrap();
        assert!(state.system.is_some());
        assert!(state.has_functions_and_variables());
        assert_eq!(state.variable_type("temp"), Some(ValueType::Double));
        assert_eq!(state.variable_type("name"), Some(ValueType::String));
        assert_eq!(state.variable_type("bad"), None);
        assert_eq!(
            state.function_signature("DigitalWrite"),
            Some(FunctionSignature::legacy("digitalwrite"))
        );
    }

    #[test]
    fn system_only_document_has_no_application() {
        let state = DeviceFunctionState::parse(br#"{"p":6,"m":[{"s":1}]}"#).unwrap();
        assert!(!state.has_functions_and_variables());
        assert!(state.function_signature("anything").is_none());
    }

    #[test]
    fn functions_alone_are_not_a_full_description() {
        let state = DeviceFunctionState::parse(br#"{"f":["go"]}"#).unwrap();
        assert_eq!(state.functions, vec!["go".to_string()]);
        assert!(!state.has_functions_and_variables());

        let state = DeviceFunctionState::parse(br#"{"v":{"x":2}}"#).unwrap();
        assert_eq!(state.variable_type("x"), Some(ValueType::Int32));
        assert!(!state.has_functions_and_variables());
    }

    #[test]
    fn typed_signatures_take_precedence() {
        let state = DeviceFunctionState::parse(
            br#"{"f":[{"name":"setLevel","args":[["level","int32"],["fast","bool"]],"returns":"int32"}],"v":{}}"#,
        )
        .unwrap();
        let sig = state.function_signature("setlevel").unwrap();
        assert_eq!(sig.args.len(), 2);
        assert_eq!(sig.args[0], ArgSpec::new(Some("level"), ValueType::Int32));
        assert_eq!(sig.args[1].value_type, ValueType::Bool);
        assert_eq!(state.functions, vec!["setLevel".to_string()]);
    }

    #[test]
    fn merge_combines_both_halves() {
        let mut state = DeviceFunctionState::parse(br#"{"p":6,"m":[]}"#).unwrap();
        state.merge(DeviceFunctionState::parse(br#"{"f":["go"],"v":{"x":2}}"#).unwrap());
        assert!(state.system.is_some());
        assert!(state.has_functions_and_variables());
        assert_eq!(state.variable_type("x"), Some(ValueType::Int32));

        let json = state.to_json();
        assert_eq!(json["p"], 6);
        assert_eq!(json["f"][0], "go");
    }

    #[test]
    fn rejects_non_object_payloads() {
        assert!(matches!(DeviceFunctionState::parse(b"[1,2]"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(DeviceFunctionState::parse(b"{nope"), Err(ProtocolError::Introspection(_))));
    }
}
