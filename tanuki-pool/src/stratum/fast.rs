//! Fast-path encoders for hot responses.
//!
//! Submit acks dominate the write path, so the common `true`, `"pong"`,
//! empty-array, and subscribe results are formatted directly instead of
//! going through the generic serialiser. Each encoder must stay
//! byte-equivalent after parse with the generic `Response`; the parity
//! tests below hold that invariant.

use serde_json::Value;

fn id_json(id: &Value) -> String {
    // SAFETY: a plain JSON value always serialises.
    serde_json::to_string(id).expect("id serialisation cannot fail")
}

pub fn result_true(id: &Value) -> String {
    format!(r#"{{"id":{},"result":true,"error":null}}"#, id_json(id))
}

pub fn result_pong(id: &Value) -> String {
    format!(r#"{{"id":{},"result":"pong","error":null}}"#, id_json(id))
}

pub fn result_empty_array(id: &Value) -> String {
    format!(r#"{{"id":{},"result":[],"error":null}}"#, id_json(id))
}

/// The `mining.subscribe` result:
/// `[subscription-tuples, extranonce1_hex, extranonce2_size]`.
///
/// `expanded` selects the four-tuple shape; otherwise the ckpool-style
/// compatibility shape with only `mining.notify` is emitted. This is a
/// pool-wide configuration switch, not a per-client negotiation.
pub fn result_subscribe(
    id: &Value,
    session_id: &str,
    extranonce1_hex: &str,
    extranonce2_size: usize,
    expanded: bool,
) -> String {
    let sid = serde_json::to_string(session_id).expect("session id serialisation cannot fail");
    let ex1 = serde_json::to_string(extranonce1_hex)
        .expect("extranonce serialisation cannot fail");

    let tuples = if expanded {
        format!(
            r#"[["mining.set_difficulty",{sid}],["mining.notify",{sid}],["mining.set_extranonce",{sid}],["mining.set_version_mask",{sid}]]"#
        )
    } else {
        format!(r#"[["mining.notify",{sid}]]"#)
    };

    format!(
        r#"{{"id":{},"result":[{tuples},{ex1},{extranonce2_size}],"error":null}}"#,
        id_json(id)
    )
}

/// Build the same subscribe result through the generic encoder; the
/// reference the fast path is tested against, and the fallback if the
/// fast path is ever removed.
pub fn subscribe_result_value(
    session_id: &str,
    extranonce1_hex: &str,
    extranonce2_size: usize,
    expanded: bool,
) -> Value {
    let tuples = if expanded {
        serde_json::json!([
            ["mining.set_difficulty", session_id],
            ["mining.notify", session_id],
            ["mining.set_extranonce", session_id],
            ["mining.set_version_mask", session_id],
        ])
    } else {
        serde_json::json!([["mining.notify", session_id]])
    };
    serde_json::json!([tuples, extranonce1_hex, extranonce2_size])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stratum::Response;
    use test_case::test_case;

    fn ids() -> Vec<Value> {
        vec![
            serde_json::json!(1),
            serde_json::json!(0),
            serde_json::json!("sub-1"),
            serde_json::json!(null),
            serde_json::json!(18446744073709551615u64),
            serde_json::json!("quote\"and\\backslash"),
        ]
    }

    fn parse(line: &str) -> Value {
        serde_json::from_str(line).expect("fast-path output must be valid JSON")
    }

    #[test]
    fn test_true_parity() {
        for id in ids() {
            let fast = parse(&result_true(&id));
            let generic =
                parse(&Response::ok(id.clone(), serde_json::json!(true)).to_line());
            assert_eq!(fast, generic, "true response diverged for id {id}");
        }
    }

    #[test]
    fn test_pong_parity() {
        for id in ids() {
            let fast = parse(&result_pong(&id));
            let generic =
                parse(&Response::ok(id.clone(), serde_json::json!("pong")).to_line());
            assert_eq!(fast, generic, "pong response diverged for id {id}");
        }
    }

    #[test]
    fn test_empty_array_parity() {
        for id in ids() {
            let fast = parse(&result_empty_array(&id));
            let generic =
                parse(&Response::ok(id.clone(), serde_json::json!([])).to_line());
            assert_eq!(fast, generic, "empty-array response diverged for id {id}");
        }
    }

    #[test_case(true; "expanded shape")]
    #[test_case(false; "compat shape")]
    fn test_subscribe_parity(expanded: bool) {
        for id in ids() {
            let fast = parse(&result_subscribe(&id, "s-01", "a1b2c3d4", 8, expanded));
            let generic = parse(
                &Response::ok(
                    id.clone(),
                    subscribe_result_value("s-01", "a1b2c3d4", 8, expanded),
                )
                .to_line(),
            );
            assert_eq!(fast, generic, "subscribe response diverged for id {id}");
        }
    }

    #[test]
    fn test_subscribe_shapes() {
        let id = serde_json::json!(1);
        let expanded = parse(&result_subscribe(&id, "sid", "00010203", 4, true));
        assert_eq!(expanded["result"][0].as_array().unwrap().len(), 4);

        let compat = parse(&result_subscribe(&id, "sid", "00010203", 4, false));
        let tuples = compat["result"][0].as_array().unwrap();
        assert_eq!(tuples.len(), 1);
        assert_eq!(tuples[0][0], "mining.notify");
    }
}
