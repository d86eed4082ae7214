use std::net::ToSocketAddrs;

use regex::Regex;

/// Namespace grammar: dot separated alphanumeric words.
pub const DEFAULT_NS_PATTERN: &str = r"^[0-9a-zA-Z]+(\.[0-9a-zA-Z]+)*$";

pub const MAX_CHUNK_ID_LEN: usize = 128;

pub fn is_valid_chunk_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= MAX_CHUNK_ID_LEN && id.bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn namespace_regex(pattern: Option<&str>) -> Result<Regex, regex::Error> {
    Regex::new(pattern.unwrap_or(DEFAULT_NS_PATTERN))
}

/// Checks that a `host:port` service address resolves and returns its port.
pub fn check_addr(addr: &str) -> Result<u16, String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| format!("`{addr}` is not of the form host:port"))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(format!("`{addr}` has no host"));
    }
    let port = match port.parse::<u16>() {
        Ok(port) if port > 0 => port,
        _ => return Err(format!("`{addr}` has no valid port")),
    };
    match addr.to_socket_addrs() {
        Ok(mut resolved) => {
            if resolved.next().is_some() {
                Ok(port)
            } else {
                Err(format!("`{addr}` resolves to no address"))
            }
        }
        Err(e) => Err(format!("`{addr}` does not resolve: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_ids() {
        assert!(is_valid_chunk_id("0123456789abcdefABCDEF"));
        assert!(is_valid_chunk_id(&"F".repeat(MAX_CHUNK_ID_LEN)));
        assert!(!is_valid_chunk_id(&"F".repeat(MAX_CHUNK_ID_LEN + 1)));
        assert!(!is_valid_chunk_id(""));
        assert!(!is_valid_chunk_id("01G3"));
        assert!(!is_valid_chunk_id("../etc"));
    }

    #[test]
    fn test_namespace_grammar_is_anchored() {
        let re = namespace_regex(None).unwrap();
        assert!(re.is_match("OPENIO"));
        assert!(re.is_match("grid.zone1"));
        assert!(!re.is_match("bad ns"));
        assert!(!re.is_match(".leading"));
        assert!(!re.is_match("trailing."));
        assert!(!re.is_match(""));

        let relaxed = namespace_regex(Some(r"^[a-z_]+$")).unwrap();
        assert!(relaxed.is_match("my_ns"));
    }

    #[test]
    fn test_addresses() {
        assert_eq!(check_addr("127.0.0.1:6000"), Ok(6000));
        assert_eq!(check_addr("[::1]:6001"), Ok(6001));
        assert_eq!(check_addr("localhost:80"), Ok(80));
        assert!(check_addr("127.0.0.1:0").is_err());
        assert!(check_addr("127.0.0.1").is_err());
        assert!(check_addr(":6000").is_err());
        assert!(check_addr("127.0.0.1:http").is_err());
    }

    #[test]
    fn test_unresolvable_host_is_rejected() {
        let err = check_addr("rawx.invalid:6000").unwrap_err();
        assert!(err.contains("rawx.invalid:6000"), "{err}");
    }
}
