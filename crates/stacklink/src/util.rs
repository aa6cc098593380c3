//! helpers around CloudFormation intrinsic functions
use serde_json::Value as Json;

/// Keys that turn a single-key object into an intrinsic function call
pub(crate) const INTRINSICS: &[&str] = &[
    "Ref",
    "Condition",
    "Fn::GetAtt",
    "Fn::Sub",
    "Fn::If",
    "Fn::Join",
    "Fn::Select",
    "Fn::Split",
    "Fn::Cidr",
    "Fn::Equals",
    "Fn::Not",
    "Fn::And",
    "Fn::Or",
    "Fn::ImportValue",
    "Fn::GetAZs",
    "Fn::Base64",
    "Fn::FindInMap",
    "Fn::Transform",
];

/// Build `{ name: value }`
pub(crate) fn intrinsic(name: &str, value: Json) -> Json {
    let mut object = serde_json::Map::new();
    object.insert(name.to_string(), value);
    Json::Object(object)
}

/// `(function name, argument)` when `value` is a single-key intrinsic call
pub(crate) fn as_intrinsic(value: &Json) -> Option<(&str, &Json)> {
    let object = value.as_object()?;
    if object.len() != 1 {
        return None;
    }

    let (key, argument) = object.iter().next()?;
    INTRINSICS
        .contains(&key.as_str())
        .then_some((key.as_str(), argument))
}

pub(crate) fn reference(logical_id: &str) -> Json {
    intrinsic("Ref", Json::String(logical_id.to_string()))
}

pub(crate) fn get_att(logical_id: &str, attribute: &str) -> Json {
    intrinsic(
        "Fn::GetAtt",
        Json::Array(vec![
            Json::String(logical_id.to_string()),
            Json::String(attribute.to_string()),
        ]),
    )
}

/// Entry name and attribute of a `Fn::GetAtt` argument (list or `A.B` string form)
pub(crate) fn get_att_target(argument: &Json) -> Option<(&str, Option<&str>)> {
    match argument {
        Json::Array(parts) => {
            let logical_id = parts.first()?.as_str()?;
            Some((logical_id, parts.get(1).and_then(Json::as_str)))
        }
        Json::String(s) => match s.split_once('.') {
            Some((logical_id, attribute)) => Some((logical_id, Some(attribute))),
            None => Some((s.as_str(), None)),
        },
        _ => None,
    }
}

/// The logical id an expression points at, for `Ref`, `Fn::GetAtt` or a plain
/// `Name`/`Name.Attr` string
pub(crate) fn logical_id_of(value: &Json) -> Option<&str> {
    match as_intrinsic(value) {
        Some(("Ref", Json::String(logical_id))) => Some(logical_id),
        Some(("Fn::GetAtt", argument)) => get_att_target(argument).map(|(id, _)| id),
        Some(_) => None,
        None => match value {
            Json::String(s) => Some(s.split_once('.').map_or(s.as_str(), |(id, _)| id)),
            _ => None,
        },
    }
}

/// Tokens of a `Fn::Sub` template: `(name, attribute)` for every `${Name}`/`${Name.Attr}`
///
/// `${!Literal}` escapes are skipped.
pub(crate) fn sub_tokens(template: &str) -> Vec<(&str, Option<&str>)> {
    let mut tokens = vec![];
    let mut rest = template;
    while let Some(start) = rest.find("${") {
        rest = &rest[start + 2..];
        let Some(end) = rest.find('}') else {
            break;
        };

        let token = &rest[..end];
        rest = &rest[end + 1..];
        if token.starts_with('!') {
            continue;
        }

        match token.split_once('.') {
            Some((name, attribute)) => tokens.push((name, Some(attribute))),
            None => tokens.push((token, None)),
        }
    }
    tokens
}

/// Text before the first `${` of a `Fn::Sub` template
pub(crate) fn sub_prefix(template: &str) -> &str {
    template.find("${").map_or(template, |at| &template[..at])
}

/// Human readable name of a json type, for error messages
pub(crate) fn json_type(value: &Json) -> &'static str {
    match value {
        Json::Null => "null",
        Json::Bool(_) => "boolean",
        Json::Number(_) => "number",
        Json::String(_) => "string",
        Json::Array(_) => "array",
        Json::Object(_) => "object",
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn sub_tokens_skip_escapes() {
        assert_eq!(
            sub_tokens("arn:${AWS::Partition}:s3:::${Bucket}/${!Literal}/${Fn.Arn}"),
            vec![("AWS::Partition", None), ("Bucket", None), ("Fn", Some("Arn"))]
        );
        assert_eq!(sub_prefix("my-table-${Stage}"), "my-table-");
    }

    #[test]
    fn logical_ids() {
        assert_eq!(logical_id_of(&json!({"Ref": "Tbl"})), Some("Tbl"));
        assert_eq!(
            logical_id_of(&json!({"Fn::GetAtt": ["Tbl", "Arn"]})),
            Some("Tbl")
        );
        assert_eq!(logical_id_of(&json!("Tbl.Arn")), Some("Tbl"));
        assert_eq!(logical_id_of(&json!({"Fn::Sub": "x"})), None);
    }

    #[test]
    fn only_single_key_objects_are_intrinsics() {
        assert!(as_intrinsic(&json!({"Ref": "A"})).is_some());
        assert!(as_intrinsic(&json!({"Ref": "A", "Other": 1})).is_none());
        assert!(as_intrinsic(&json!({"Type": "A"})).is_none());
    }
}
