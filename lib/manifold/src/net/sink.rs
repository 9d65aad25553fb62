use serde_json::json;

/// Opaque downstream consumer of tagged frames. The stratifier and the
/// generator both live behind this seam; the engine only ever hands them a
/// finished text frame.
pub trait Sink: Send + Sync {
    fn deliver(&self, msg: &str);
}

/// Drop command for the stratifier, covering both direct clients and ids the
/// connector could not resolve.
#[inline]
pub fn stratifier_drop(id: u64) -> String {
    format!("dropclient={}", id)
}

/// Termination notice for the upstream pool when a passthrough parent dies in
/// whole-process passthrough mode.
pub fn generator_term(id: u64, address: &str, server: usize) -> String {
    json!({
        "id": 42,
        "client_id": id,
        "address": address,
        "server": server,
        "method": "mining.term",
        "params": []
    })
    .to_string()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stratifier_drop_format() {
        assert_eq!(stratifier_drop(17), "dropclient=17");
    }

    #[test]
    fn test_generator_term_shape() {
        let msg = generator_term(3, "10.1.2.3", 0);
        let val: serde_json::Value = serde_json::from_str(&msg).unwrap();

        assert_eq!(val["method"], "mining.term");
        assert_eq!(val["client_id"], 3);
        assert_eq!(val["address"], "10.1.2.3");
        assert_eq!(val["server"], 0);
        assert!(val["params"].as_array().unwrap().is_empty());
    }
}
