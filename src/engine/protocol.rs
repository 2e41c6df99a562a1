//! Engine REST response parsing
//!
//! Most endpoints wrap their payload in a `{"result": "ok" | "nok", ...}`
//! envelope. `hasNext` and `getNext` answer with bare objects and get their
//! own rules.

use serde::Deserialize;
use serde_json::Value;

use crate::common::{Error, Result};
use crate::types::{JsonMap, Step};

/// Unwrap a `result` envelope, returning the remaining fields on `"ok"`
pub fn parse_envelope(body: Value) -> Result<JsonMap> {
    let Value::Object(mut map) = body else {
        return Err(Error::EngineProtocol(format!(
            "expected a JSON object, got: {}",
            body
        )));
    };

    match map.remove("result") {
        Some(Value::String(result)) if result == "ok" => Ok(map),
        Some(Value::String(result)) if result == "nok" => match map.get("error") {
            Some(Value::String(message)) => Err(Error::EngineProtocol(message.clone())),
            Some(other) => Err(Error::EngineProtocol(other.to_string())),
            None => Err(Error::EngineProtocol(
                "engine responded with nok status".to_string(),
            )),
        },
        Some(other) => Err(Error::EngineProtocol(format!(
            "unexpected result value: {}",
            other
        ))),
        None => Err(Error::EngineProtocol(
            "engine did not respond with ok status".to_string(),
        )),
    }
}

/// Parse the `hasNext` response: `{"hasNext": "true" | "false"}`
///
/// Boolean values are accepted as well since some engine builds send them.
pub fn parse_has_next(body: &Value) -> Result<bool> {
    match body.get("hasNext") {
        Some(Value::String(flag)) => match flag.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            other => Err(Error::EngineProtocol(format!(
                "invalid hasNext value: {}",
                other
            ))),
        },
        Some(Value::Bool(flag)) => Ok(*flag),
        Some(other) => Err(Error::EngineProtocol(format!(
            "invalid hasNext value: {}",
            other
        ))),
        None => Err(Error::EngineProtocol(format!(
            "hasNext field missing in response: {}",
            body
        ))),
    }
}

/// Raw `getNext` payload as the engine sends it
#[derive(Debug, Deserialize)]
pub struct EngineStep {
    #[serde(rename = "currentElementID", default)]
    pub id: Option<Value>,
    #[serde(rename = "currentElementName", default)]
    pub name: Option<String>,
    #[serde(rename = "modelName", default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub properties: Option<Value>,
    #[serde(default)]
    pub actions: Option<Value>,
}

impl EngineStep {
    /// Normalize into the canonical step shape
    ///
    /// A step without a name cannot be dispatched and is rejected as malformed.
    pub fn normalize(self) -> Result<Step> {
        let name = match self.name {
            Some(name) if !name.is_empty() => name,
            _ => {
                return Err(Error::MalformedStep(format!(
                    "element {} has no name",
                    self.id.as_ref().map(Value::to_string).unwrap_or_default()
                )))
            }
        };

        let id = self.id.and_then(|id| match id {
            Value::String(s) => Some(s),
            Value::Null => None,
            other => Some(other.to_string()),
        });

        Ok(Step {
            id,
            name,
            model_name: self.model_name,
            data: self.data,
            kind: None,
            properties: self.properties,
            actions: self.actions,
        })
    }
}

/// Parse and normalize a `getNext` response body
pub fn parse_next_step(body: Value) -> Result<Step> {
    let raw: EngineStep = serde_json::from_value(body)
        .map_err(|e| Error::MalformedStep(format!("unexpected getNext shape: {}", e)))?;
    raw.normalize()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_envelope_ok_strips_result() {
        let map = parse_envelope(json!({"result": "ok", "data": {"x": 1}})).unwrap();
        assert!(!map.contains_key("result"));
        assert_eq!(map["data"], json!({"x": 1}));
    }

    #[test]
    fn test_envelope_nok_uses_error_field() {
        let err = parse_envelope(json!({"result": "nok", "error": "no model loaded"})).unwrap_err();
        match err {
            Error::EngineProtocol(message) => assert_eq!(message, "no model loaded"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_envelope_nok_without_error_is_generic() {
        let err = parse_envelope(json!({"result": "nok"})).unwrap_err();
        assert!(err.to_string().contains("nok"));
    }

    #[test]
    fn test_envelope_missing_or_unknown_result() {
        assert!(matches!(
            parse_envelope(json!({"data": {}})),
            Err(Error::EngineProtocol(_))
        ));
        assert!(matches!(
            parse_envelope(json!({"result": "maybe"})),
            Err(Error::EngineProtocol(_))
        ));
        assert!(matches!(
            parse_envelope(json!(["ok"])),
            Err(Error::EngineProtocol(_))
        ));
    }

    #[test]
    fn test_has_next_string_flags() {
        assert!(parse_has_next(&json!({"hasNext": "true"})).unwrap());
        assert!(!parse_has_next(&json!({"hasNext": "false"})).unwrap());
        assert!(parse_has_next(&json!({"hasNext": true})).unwrap());
    }

    #[test]
    fn test_has_next_missing_field() {
        let err = parse_has_next(&json!({"result": "ok"})).unwrap_err();
        assert!(matches!(err, Error::EngineProtocol(_)));
        assert!(parse_has_next(&json!({"hasNext": "yes"})).is_err());
    }

    #[test]
    fn test_next_step_normalizes_names() {
        let step = parse_next_step(json!({
            "currentElementID": "e0",
            "currentElementName": "e_load_home_page",
            "modelName": "NavigationModel"
        }))
        .unwrap();

        assert_eq!(step.id.as_deref(), Some("e0"));
        assert_eq!(step.name, "e_load_home_page");
        assert_eq!(step.model_name.as_deref(), Some("NavigationModel"));
        assert!(step.data.is_none());
        assert!(step.properties.is_none());
        assert!(step.actions.is_none());
    }

    #[test]
    fn test_next_step_passes_optional_fields_through() {
        let step = parse_next_step(json!({
            "currentElementID": "v1",
            "currentElementName": "v_homepage",
            "modelName": "NavigationModel",
            "data": [{"itemsInCart": "0"}],
            "properties": {"x": 10, "y": 20},
            "actions": ["itemsInCart = 0;"]
        }))
        .unwrap();

        assert_eq!(step.data, Some(json!([{"itemsInCart": "0"}])));
        assert_eq!(step.properties, Some(json!({"x": 10, "y": 20})));
        assert_eq!(step.actions, Some(json!(["itemsInCart = 0;"])));
    }

    #[test]
    fn test_next_step_without_name_is_malformed() {
        let err = parse_next_step(json!({"currentElementID": "v9", "modelName": "M"})).unwrap_err();
        assert!(matches!(err, Error::MalformedStep(_)));

        let err = parse_next_step(json!({"currentElementID": "v9", "currentElementName": ""}))
            .unwrap_err();
        assert!(matches!(err, Error::MalformedStep(_)));
    }

    #[test]
    fn test_numeric_id_is_stringified() {
        let step =
            parse_next_step(json!({"currentElementID": 7, "currentElementName": "v_seven"})).unwrap();
        assert_eq!(step.id.as_deref(), Some("7"));
    }
}
