use super::{ConnectOptions, Engine};

pub fn parse_engine(s: &str) -> Option<Engine> {
    match s.to_lowercase().as_str() {
        "mongodb" | "mongo" => Some(Engine::MongoDb),
        #[cfg(any(test, feature = "store-mock"))]
        "mock" => Some(Engine::Mock),
        _ => None,
    }
}

/// Parse `key=value` pairs; entries without `=` are ignored.
pub fn parse_connect_kv(pairs: &[String]) -> ConnectOptions {
    let mut opts = ConnectOptions::default();
    for p in pairs {
        if let Some((k, v)) = p.split_once('=') {
            opts.params.insert(k.trim().to_string(), v.to_string());
        }
    }
    opts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_names() {
        assert_eq!(parse_engine("MongoDB"), Some(Engine::MongoDb));
        assert_eq!(parse_engine("mock"), Some(Engine::Mock));
        assert_eq!(parse_engine("redis"), None);
    }

    #[test]
    fn kv_keeps_equals_in_value() {
        let opts = parse_connect_kv(&[
            "uri=mongodb://h:27017/?retryWrites=true&w=majority".into(),
            "garbage".into(),
        ]);
        assert_eq!(opts.get("uri"), Some("mongodb://h:27017/?retryWrites=true&w=majority"));
        assert_eq!(opts.params.len(), 1);
    }
}
