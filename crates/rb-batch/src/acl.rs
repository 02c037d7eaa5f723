//! Router ACL matching and HTTP Basic credential verification for the
//! batch endpoint's request pipeline.

use std::net::IpAddr;

use rb_common::config::BatchRouterAuth;

/// The `(username, password)` pair configured for a matched router.
pub struct MatchedRouter<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

/// Step 3: find the ACL entry whose `router_ip` matches the request's
/// observed source address exactly. No match is a 401, decided by the
/// caller.
pub fn match_router<'a>(routers: &'a [BatchRouterAuth], source_ip: IpAddr) -> Option<MatchedRouter<'a>> {
    routers
        .iter()
        .find(|r| r.router_ip.parse::<IpAddr>().map(|ip| ip == source_ip).unwrap_or(false))
        .map(|r| MatchedRouter {
            username: &r.username,
            password: &r.password,
        })
}

/// Step 4: decode an `Authorization: Basic <base64>` header value and
/// compare against the matched router's credentials.
pub fn verify_basic_auth(header_value: Option<&str>, expected: &MatchedRouter<'_>) -> bool {
    let Some((user, pass)) = decode_basic_auth(header_value) else {
        return false;
    };
    user == expected.username && pass == expected.password
}

fn decode_basic_auth(header_value: Option<&str>) -> Option<(String, String)> {
    let value = header_value?;
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routers() -> Vec<BatchRouterAuth> {
        vec![BatchRouterAuth {
            username: "router1".to_string(),
            password: "a-sixteen-char-pw!!".to_string(),
            router_ip: "10.0.0.1".to_string(),
        }]
    }

    fn encode_basic(user: &str, pass: &str) -> String {
        use base64::Engine;
        format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode(format!("{user}:{pass}"))
        )
    }

    #[test]
    fn test_match_router_exact_ip() {
        let r = routers();
        let matched = match_router(&r, "10.0.0.1".parse().unwrap());
        assert!(matched.is_some());
        assert!(match_router(&r, "10.0.0.2".parse().unwrap()).is_none());
    }

    #[test]
    fn test_verify_basic_auth_success() {
        let r = routers();
        let matched = match_router(&r, "10.0.0.1".parse().unwrap()).unwrap();
        let header = encode_basic("router1", "a-sixteen-char-pw!!");
        assert!(verify_basic_auth(Some(&header), &matched));
    }

    #[test]
    fn test_verify_basic_auth_wrong_password() {
        let r = routers();
        let matched = match_router(&r, "10.0.0.1".parse().unwrap()).unwrap();
        let header = encode_basic("router1", "wrong-password!!");
        assert!(!verify_basic_auth(Some(&header), &matched));
    }

    #[test]
    fn test_verify_basic_auth_missing_header() {
        let r = routers();
        let matched = match_router(&r, "10.0.0.1".parse().unwrap()).unwrap();
        assert!(!verify_basic_auth(None, &matched));
    }
}
