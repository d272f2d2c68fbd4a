//! Renders response bodies.
//!
//! Two per-request flags control the output.  With `envelope`, the payload is wrapped as
//! `{"code": ..., "data": ...}` or `{"code": ..., "errors": [...]}`; without it, the bare
//! document or bare list of error messages is sent.  With `indent`, the JSON is pretty-printed
//! with two spaces; indentation never changes the content.

use log::error;
use serde::Serialize;
use std::collections::HashMap;
use treestore::Document;

/// Content type of every response body.
pub const CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// Server-wide defaults for the per-request flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseDefaults {
    pub envelope: bool,
    pub indent: bool,
}

/// The flags that apply to one response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseOptions {
    pub envelope: bool,
    pub indent: bool,
}

impl ResponseOptions {
    /// Applies any `envelope` and `indent` query parameters over the defaults.
    pub fn from_query(query: &HashMap<String, String>, defaults: ResponseDefaults) -> Self {
        Self {
            envelope: resolve_flag(query.get("envelope").map(String::as_str), defaults.envelope),
            indent: resolve_flag(query.get("indent").map(String::as_str), defaults.indent),
        }
    }
}

/// An explicit "true" or "false", in any case, overrides the default; anything else, including
/// a missing value, falls back to it.
pub fn resolve_flag(value: Option<&str>, default: bool) -> bool {
    match value {
        Some(v) if v.eq_ignore_ascii_case("true") => true,
        Some(v) if v.eq_ignore_ascii_case("false") => false,
        _ => default,
    }
}

/// What a response carries.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Data(Document),
    Errors(Vec<String>),
    Empty,
}

/// A rendered response, independent of the HTTP library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub body: Option<Vec<u8>>,
    /// The methods a 405 response should list in its Allow header.
    pub allow: Option<String>,
}

#[derive(Serialize)]
struct Envelope<'a> {
    code: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a Document>,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<&'a [String]>,
}

/// Renders the payload with the given status code.  An empty payload has no body.
pub fn write(payload: &Payload, status: u16, options: ResponseOptions) -> Response {
    let envelope = Envelope {
        code: status,
        data: None,
        errors: None,
    };
    let rendered = match (payload, options.envelope) {
        (Payload::Empty, _) => {
            return Response {
                status,
                body: None,
                allow: None,
            };
        }
        (Payload::Data(data), true) => serialize(
            &Envelope {
                data: Some(data),
                ..envelope
            },
            options.indent,
        ),
        (Payload::Errors(errors), true) => serialize(
            &Envelope {
                errors: Some(errors.as_slice()),
                ..envelope
            },
            options.indent,
        ),
        (Payload::Data(data), false) => serialize(data, options.indent),
        (Payload::Errors(errors), false) => serialize(errors, options.indent),
    };

    match rendered {
        Ok(body) => Response {
            status,
            body: Some(body),
            allow: None,
        },
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            Response {
                status: 500,
                body: None,
                allow: None,
            }
        }
    }
}

fn serialize<T: Serialize + ?Sized>(value: &T, indent: bool) -> serde_json::Result<Vec<u8>> {
    if indent {
        serde_json::to_vec_pretty(value)
    } else {
        serde_json::to_vec(value)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use maplit::hashmap;
    use serde_json::json;

    const DEFAULTS: ResponseDefaults = ResponseDefaults {
        envelope: false,
        indent: true,
    };

    fn body(response: Response) -> String {
        String::from_utf8(response.body.unwrap()).unwrap()
    }

    #[test]
    fn flags_resolve() {
        assert!(resolve_flag(Some("true"), false));
        assert!(resolve_flag(Some("TRUE"), false));
        assert!(!resolve_flag(Some("False"), true));
        assert!(resolve_flag(Some("yes"), true));
        assert!(!resolve_flag(Some(""), false));
        assert!(resolve_flag(None, true));
    }

    #[test]
    fn query_overrides_defaults() {
        let query = hashmap!(
            "envelope".to_string() => "true".to_string(),
            "indent".to_string() => "false".to_string(),
        );
        assert_eq!(
            ResponseOptions::from_query(&query, DEFAULTS),
            ResponseOptions {
                envelope: true,
                indent: false
            }
        );
        assert_eq!(
            ResponseOptions::from_query(&HashMap::new(), DEFAULTS),
            ResponseOptions {
                envelope: false,
                indent: true
            }
        );
    }

    #[test]
    fn compact_envelope_exact() {
        let options = ResponseOptions {
            envelope: true,
            indent: false,
        };
        let response = write(&Payload::Data(json!({"x": 1})), 200, options);
        assert_eq!(response.status, 200);
        assert_eq!(body(response), r#"{"code":200,"data":{"x":1}}"#);
    }

    #[test]
    fn envelope_errors() {
        let options = ResponseOptions {
            envelope: true,
            indent: false,
        };
        let response = write(
            &Payload::Errors(vec!["/a: bad".to_string()]),
            400,
            options,
        );
        assert_eq!(body(response), r#"{"code":400,"errors":["/a: bad"]}"#);
    }

    #[test]
    fn bare_output() {
        let options = ResponseOptions {
            envelope: false,
            indent: false,
        };
        assert_eq!(
            body(write(&Payload::Data(json!({"x": 1})), 200, options)),
            r#"{"x":1}"#
        );
        assert_eq!(
            body(write(
                &Payload::Errors(vec!["nope".to_string()]),
                404,
                options
            )),
            r#"["nope"]"#
        );
    }

    #[test]
    fn indent_changes_whitespace_only() {
        let doc = json!({"x": [1, {"y": null}]});
        let pretty = body(write(
            &Payload::Data(doc.clone()),
            200,
            ResponseOptions {
                envelope: false,
                indent: true,
            },
        ));
        assert_eq!(pretty, "{\n  \"x\": [\n    1,\n    {\n      \"y\": null\n    }\n  ]\n}");
        assert_eq!(serde_json::from_str::<Document>(&pretty).unwrap(), doc);
    }

    #[test]
    fn empty_has_no_body() {
        let response = write(
            &Payload::Empty,
            204,
            ResponseOptions {
                envelope: true,
                indent: true,
            },
        );
        assert_eq!(
            response,
            Response {
                status: 204,
                body: None,
                allow: None,
            }
        );
    }
}
