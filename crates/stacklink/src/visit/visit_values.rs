use super::VisitMut;
use serde_json::Value as Json;

/// Recursively visit all string leaves of a json document mutably
///
/// The visitor receives the [Json] node (not the inner [String]) so it may replace the
/// string with a value of another type.
pub trait VisitStringsMut {
    fn visit_strings_mut(&mut self, visitor: &mut dyn VisitMut<Json>);
}

impl VisitStringsMut for Json {
    fn visit_strings_mut(&mut self, visitor: &mut dyn VisitMut<Json>) {
        match self {
            Json::String(_) => visitor.visit_mut(self),
            Json::Array(array) => {
                for element in array {
                    element.visit_strings_mut(visitor);
                }
            }
            Json::Object(object) => {
                for value in object.values_mut() {
                    value.visit_strings_mut(visitor);
                }
            }
            Json::Null | Json::Bool(_) | Json::Number(_) => {}
        }
    }
}

/// Recursively visit all object keys of a json document mutably
///
/// Key order is preserved; when two keys collide after rewriting the later one wins.
pub trait VisitKeysMut {
    fn visit_keys_mut(&mut self, visitor: &mut dyn VisitMut<String>);
}

impl VisitKeysMut for Json {
    fn visit_keys_mut(&mut self, visitor: &mut dyn VisitMut<String>) {
        match self {
            Json::Array(array) => {
                for element in array {
                    element.visit_keys_mut(visitor);
                }
            }
            Json::Object(object) => {
                let entries = std::mem::take(object);
                for (mut key, mut value) in entries {
                    visitor.visit_mut(&mut key);
                    value.visit_keys_mut(visitor);
                    object.insert(key, value);
                }
            }
            Json::Null | Json::Bool(_) | Json::Number(_) | Json::String(_) => {}
        }
    }
}
