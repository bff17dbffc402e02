use crate::models::request::RequestContext;

/// Derives the bucket key a caller is counted under. Every extractor
/// namespaces its keys so different key types never collide, and every one
/// falls back to the client IP when its primary source is absent.
pub trait KeyExtractor: Send + Sync {
    fn extract(&self, ctx: &RequestContext) -> String;
}

/// Build the extractor for a configured key type. An unknown type, or a
/// `header` type without a header name, degrades to plain IP extraction.
pub fn new_extractor(key_type: &str, key_header: &str) -> Box<dyn KeyExtractor> {
    match key_type {
        "user" => Box::new(UserExtractor),
        "apikey" => Box::new(ApiKeyExtractor),
        "header" if !key_header.is_empty() => Box::new(HeaderExtractor {
            header_name: key_header.to_string(),
        }),
        _ => Box::new(IpExtractor),
    }
}

/// Client IP: first X-Forwarded-For hop, then X-Real-IP, then the peer
/// address with its port stripped.
pub struct IpExtractor;

pub fn client_ip(ctx: &RequestContext) -> String {
    if let Some(forwarded) = ctx.header("X-Forwarded-For") {
        if let Some(first) = forwarded.split(',').next() {
            let ip = first.trim();
            if !ip.is_empty() {
                return ip.to_string();
            }
        }
    }

    if let Some(real_ip) = ctx.header("X-Real-IP") {
        let ip = real_ip.trim();
        if !ip.is_empty() {
            return ip.to_string();
        }
    }

    ctx.peer_addr.ip().to_string()
}

impl KeyExtractor for IpExtractor {
    fn extract(&self, ctx: &RequestContext) -> String {
        format!("ip:{}", client_ip(ctx))
    }
}

/// Caller identity from a bearer token or the X-User-ID header.
pub struct UserExtractor;

impl KeyExtractor for UserExtractor {
    fn extract(&self, ctx: &RequestContext) -> String {
        if let Some(auth) = ctx.header("Authorization") {
            let mut parts = auth.splitn(2, ' ');
            if let (Some(scheme), Some(token)) = (parts.next(), parts.next()) {
                if scheme.eq_ignore_ascii_case("bearer") && !token.is_empty() {
                    return format!("user:{token}");
                }
            }
        }

        if let Some(user_id) = ctx.header("X-User-ID") {
            if !user_id.is_empty() {
                return format!("user:{user_id}");
            }
        }

        IpExtractor.extract(ctx)
    }
}

/// API key from X-API-Key, `Authorization: ApiKey`, or the `api_key`
/// query parameter, in that order.
pub struct ApiKeyExtractor;

impl KeyExtractor for ApiKeyExtractor {
    fn extract(&self, ctx: &RequestContext) -> String {
        if let Some(key) = ctx.header("X-API-Key") {
            if !key.is_empty() {
                return format!("apikey:{key}");
            }
        }

        if let Some(auth) = ctx.header("Authorization") {
            let mut parts = auth.splitn(2, ' ');
            if let (Some(scheme), Some(key)) = (parts.next(), parts.next()) {
                if scheme.eq_ignore_ascii_case("apikey") && !key.is_empty() {
                    return format!("apikey:{key}");
                }
            }
        }

        for (name, value) in url::form_urlencoded::parse(ctx.query.as_bytes()) {
            if name == "api_key" && !value.is_empty() {
                return format!("apikey:{value}");
            }
        }

        IpExtractor.extract(ctx)
    }
}

/// Value of one configured header.
pub struct HeaderExtractor {
    header_name: String,
}

impl KeyExtractor for HeaderExtractor {
    fn extract(&self, ctx: &RequestContext) -> String {
        if let Some(value) = ctx.header(&self.header_name) {
            if !value.is_empty() {
                return format!("header:{}:{}", self.header_name, value);
            }
        }

        IpExtractor.extract(ctx)
    }
}
