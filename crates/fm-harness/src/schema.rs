use serde_json::Value;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Argument validation error, pointing at the offending field.
#[derive(Debug, thiserror::Error)]
#[error("invalid argument '{field}': {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Validate tool arguments against the subset of JSON Schema the tool
/// definitions use: object root, `required`, primitive `type`s, `enum`
/// membership, and typed array items. Unknown arguments pass through.
pub fn validate(schema: &Value, args: &Value) -> Result<(), ValidationError> {
    let empty = Value::Object(serde_json::Map::new());
    let args = if args.is_null() { &empty } else { args };
    let object = args
        .as_object()
        .ok_or_else(|| ValidationError::new("(root)", "arguments must be a JSON object"))?;

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            match object.get(field) {
                None | Some(Value::Null) => {
                    return Err(ValidationError::new(field, "required field is missing"));
                }
                Some(_) => {}
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };
    for (field, spec) in properties {
        let Some(value) = object.get(field) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        check_type(field, spec, value)?;
        if let Some(allowed) = spec.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                return Err(ValidationError::new(
                    field,
                    format!(
                        "must be one of {}",
                        allowed
                            .iter()
                            .map(|v| v.to_string())
                            .collect::<Vec<_>>()
                            .join(", ")
                    ),
                ));
            }
        }
    }
    Ok(())
}

fn check_type(field: &str, spec: &Value, value: &Value) -> Result<(), ValidationError> {
    let Some(expected) = spec.get("type").and_then(Value::as_str) else {
        return Ok(());
    };
    let ok = match expected {
        "string" => value.is_string(),
        "integer" => value.as_i64().is_some() || value.as_u64().is_some(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    };
    if !ok {
        return Err(ValidationError::new(field, format!("expected {expected}")));
    }
    if expected == "array" {
        if let Some(item_type) = spec
            .get("items")
            .and_then(|items| items.get("type"))
            .and_then(Value::as_str)
        {
            for (index, item) in value.as_array().into_iter().flatten().enumerate() {
                let item_ok = match item_type {
                    "string" => item.is_string(),
                    "integer" => item.as_i64().is_some(),
                    "number" => item.is_number(),
                    "boolean" => item.is_boolean(),
                    "object" => item.is_object(),
                    _ => true,
                };
                if !item_ok {
                    return Err(ValidationError::new(
                        format!("{field}[{index}]"),
                        format!("expected {item_type}"),
                    ));
                }
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
