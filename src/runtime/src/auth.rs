//! Registry token authentication.
//!
//! Implements the two token flows a registry may ask for in a `Bearer`
//! challenge: the plain GET token endpoint and the OAuth2 POST form.

use std::collections::HashMap;

use a3s_diff_core::error::{DiffError, Result};
use reqwest::header::HeaderMap;
use serde::Deserialize;

/// Maximum bytes of an error response body kept in [`DiffError::UnexpectedStatus`].
const ERROR_BODY_LIMIT: usize = 64_000;

/// A parsed `WWW-Authenticate` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// Lowercased auth scheme (e.g., "bearer", "basic")
    pub scheme: String,
    /// Challenge parameters with lowercased keys
    pub parameters: HashMap<String, String>,
}

impl Challenge {
    /// Parse a single challenge such as
    /// `Bearer realm="https://auth.example.io/token",service="registry"`.
    pub fn parse(header: &str) -> Result<Self> {
        let header = header.trim();
        let (scheme, rest) = header.split_once(' ').unwrap_or((header, ""));
        if scheme.is_empty() {
            return Err(DiffError::AuthError("empty auth challenge".to_string()));
        }

        let mut parameters = HashMap::new();
        let mut chars = rest.chars().peekable();
        loop {
            while matches!(chars.peek(), Some(c) if *c == ',' || c.is_whitespace()) {
                chars.next();
            }
            let key: String = chars
                .by_ref()
                .take_while(|c| *c != '=')
                .collect::<String>()
                .trim()
                .to_ascii_lowercase();
            if key.is_empty() {
                break;
            }

            let mut value = String::new();
            if chars.peek() == Some(&'"') {
                chars.next();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '\\' => value.extend(chars.next()),
                        '"' => {
                            closed = true;
                            break;
                        }
                        c => value.push(c),
                    }
                }
                if !closed {
                    return Err(DiffError::AuthError(format!(
                        "unterminated quoted value for '{}' in auth challenge",
                        key
                    )));
                }
            } else {
                while let Some(c) = chars.peek() {
                    if *c == ',' {
                        break;
                    }
                    value.push(*c);
                    chars.next();
                }
                value = value.trim().to_string();
            }
            parameters.insert(key, value);
        }

        Ok(Self {
            scheme: scheme.to_ascii_lowercase(),
            parameters,
        })
    }
}

/// Options for requesting a token.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TokenOptions {
    pub realm: String,
    pub service: String,
    pub scopes: Vec<String>,
    pub username: String,
    pub secret: String,
}

/// Derive token request options from a registry challenge.
pub fn generate_token_options(
    host: &str,
    username: &str,
    secret: &str,
    challenge: &Challenge,
) -> Result<TokenOptions> {
    let realm = challenge.parameters.get("realm").ok_or_else(|| {
        DiffError::AuthError("no realm specified for token auth challenge".to_string())
    })?;
    let realm = reqwest::Url::parse(realm).map_err(|e| {
        DiffError::AuthError(format!("invalid token auth challenge realm: {}", e))
    })?;

    let mut opts = TokenOptions {
        realm: realm.to_string(),
        service: challenge
            .parameters
            .get("service")
            .cloned()
            .unwrap_or_default(),
        scopes: Vec::new(),
        username: username.to_string(),
        secret: secret.to_string(),
    };

    match challenge.parameters.get("scope") {
        Some(scope) => opts.scopes.push(scope.clone()),
        None => tracing::debug!(host = %host, "No scope specified for token auth challenge"),
    }

    Ok(opts)
}

#[derive(Debug, Deserialize)]
struct GetTokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct PostTokenResponse {
    #[serde(default)]
    access_token: String,
}

/// Fetch a token with a GET request to the realm.
///
/// `access_token` takes precedence over `token` when both are returned.
pub async fn fetch_token(
    client: &reqwest::Client,
    headers: &HeaderMap,
    opts: &TokenOptions,
) -> Result<String> {
    let mut query: Vec<(&str, &str)> = Vec::new();
    if !opts.service.is_empty() {
        query.push(("service", opts.service.as_str()));
    }
    for scope in &opts.scopes {
        query.push(("scope", scope.as_str()));
    }

    let mut request = client
        .get(&opts.realm)
        .headers(headers.clone())
        .query(&query);
    if !opts.secret.is_empty() {
        request = request.basic_auth(&opts.username, Some(&opts.secret));
    }

    let response = request
        .send()
        .await
        .map_err(|e| {
            DiffError::AuthError(format!("token request to {} failed: {}", opts.realm, e))
        })?;
    let response = check_status(response).await?;

    let body: GetTokenResponse = response
        .json()
        .await
        .map_err(|e| DiffError::AuthError(format!("unable to decode token response: {}", e)))?;

    let token = if body.access_token.is_empty() {
        body.token
    } else {
        body.access_token
    };
    if token.is_empty() {
        return Err(DiffError::NoToken);
    }
    Ok(token)
}

/// Fetch a token with an OAuth2 POST to the realm.
///
/// Uses the password grant when a username is set, otherwise treats the
/// secret as a refresh token.
pub async fn fetch_token_with_oauth(
    client: &reqwest::Client,
    headers: &HeaderMap,
    client_id: &str,
    opts: &TokenOptions,
) -> Result<String> {
    let scope = opts.scopes.join(" ");
    let mut form: Vec<(&str, &str)> = Vec::new();
    if !opts.scopes.is_empty() {
        form.push(("scope", scope.as_str()));
    }
    form.push(("service", opts.service.as_str()));
    form.push(("client_id", client_id));
    if opts.username.is_empty() {
        form.push(("grant_type", "refresh_token"));
        form.push(("refresh_token", opts.secret.as_str()));
    } else {
        form.push(("grant_type", "password"));
        form.push(("username", opts.username.as_str()));
        form.push(("password", opts.secret.as_str()));
    }

    let response = client
        .post(&opts.realm)
        .headers(headers.clone())
        .form(&form)
        .send()
        .await
        .map_err(|e| {
            DiffError::AuthError(format!("token request to {} failed: {}", opts.realm, e))
        })?;
    let response = check_status(response).await?;

    let body: PostTokenResponse = response
        .json()
        .await
        .map_err(|e| DiffError::AuthError(format!("unable to decode token response: {}", e)))?;
    Ok(body.access_token)
}

async fn check_status(mut response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if (200..400).contains(&status.as_u16()) {
        return Ok(response);
    }

    let mut body = Vec::new();
    while body.len() < ERROR_BODY_LIMIT {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(ERROR_BODY_LIMIT - body.len());
                body.extend_from_slice(&chunk[..take]);
            }
            _ => break,
        }
    }

    Err(DiffError::UnexpectedStatus {
        status: status.to_string(),
        status_code: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answer one HTTP request with `status` and `body`; yields the raw request.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/token", listener.local_addr().unwrap());

        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                request.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text
                        .lines()
                        .find_map(|l| {
                            let (k, v) = l.split_once(':')?;
                            k.eq_ignore_ascii_case("content-length")
                                .then(|| v.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                concat!(
                    "HTTP/1.1 {}\r\n",
                    "Content-Type: application/json\r\n",
                    "Content-Length: {}\r\n",
                    "Connection: close\r\n\r\n{}"
                ),
                status,
                body.len(),
                body
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8_lossy(&request).to_string()
        });

        (url, handle)
    }

    fn opts(realm: String) -> TokenOptions {
        TokenOptions {
            realm,
            service: "registry.example.io".to_string(),
            scopes: vec!["repository:library/alpine:pull".to_string()],
            username: "alice".to_string(),
            secret: "s3cret".to_string(),
        }
    }

    #[test]
    fn test_parse_bearer_challenge() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.example.io/token",service="registry.example.io",scope="repository:a/b:pull,push""#,
        )
        .unwrap();

        assert_eq!(challenge.scheme, "bearer");
        assert_eq!(
            challenge.parameters["realm"],
            "https://auth.example.io/token"
        );
        assert_eq!(challenge.parameters["service"], "registry.example.io");
        assert_eq!(challenge.parameters["scope"], "repository:a/b:pull,push");
    }

    #[test]
    fn test_parse_unquoted_and_escaped_values() {
        let challenge = Challenge::parse(r#"Basic realm=simple, note="say \"hi\"""#).unwrap();

        assert_eq!(challenge.scheme, "basic");
        assert_eq!(challenge.parameters["realm"], "simple");
        assert_eq!(challenge.parameters["note"], "say \"hi\"");
    }

    #[test]
    fn test_parse_unterminated_quote() {
        assert!(Challenge::parse(r#"Bearer realm="https://x"#).is_err());
    }

    #[test]
    fn test_generate_token_options_requires_realm() {
        let challenge = Challenge::parse(r#"Bearer service="registry""#).unwrap();
        let err = generate_token_options("registry", "", "", &challenge).unwrap_err();

        assert!(err
            .to_string()
            .contains("no realm specified for token auth challenge"));
    }

    #[test]
    fn test_generate_token_options_rejects_bad_realm() {
        let challenge = Challenge::parse(r#"Bearer realm="not a url""#).unwrap();
        let err = generate_token_options("registry", "", "", &challenge).unwrap_err();

        assert!(err.to_string().contains("invalid token auth challenge realm"));
    }

    #[test]
    fn test_generate_token_options() {
        let challenge = Challenge::parse(
            r#"Bearer realm="https://auth.example.io/token",service="registry.example.io",scope="repository:a:pull""#,
        )
        .unwrap();
        let opts = generate_token_options("registry.example.io", "bob", "pw", &challenge).unwrap();

        assert_eq!(opts.realm, "https://auth.example.io/token");
        assert_eq!(opts.service, "registry.example.io");
        assert_eq!(opts.scopes, vec!["repository:a:pull".to_string()]);
        assert_eq!(opts.username, "bob");
        assert_eq!(opts.secret, "pw");
    }

    #[test]
    fn test_generate_token_options_without_scope() {
        let challenge =
            Challenge::parse(r#"Bearer realm="https://auth.example.io/token""#).unwrap();
        let opts = generate_token_options("registry", "", "", &challenge).unwrap();

        assert!(opts.scopes.is_empty());
        assert!(opts.service.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_token_get() {
        let (url, server) = serve_once("200 OK", r#"{"token":"abc"}"#).await;

        let token = fetch_token(&reqwest::Client::new(), &HeaderMap::new(), &opts(url))
            .await
            .unwrap();
        let request = server.await.unwrap();

        assert_eq!(token, "abc");
        assert!(request.starts_with("GET /token?"));
        assert!(request.contains("service=registry.example.io"));
        assert!(request.contains("scope=repository%3Alibrary%2Falpine%3Apull"));
        assert!(request.to_ascii_lowercase().contains("authorization: basic "));
    }

    #[tokio::test]
    async fn test_fetch_token_prefers_access_token() {
        let (url, server) =
            serve_once("200 OK", r#"{"token":"old","access_token":"new"}"#).await;

        let token = fetch_token(&reqwest::Client::new(), &HeaderMap::new(), &opts(url))
            .await
            .unwrap();
        server.await.unwrap();

        assert_eq!(token, "new");
    }

    #[tokio::test]
    async fn test_fetch_token_anonymous_has_no_auth_header() {
        let (url, server) = serve_once("200 OK", r#"{"token":"anon"}"#).await;
        let mut anonymous = opts(url);
        anonymous.username.clear();
        anonymous.secret.clear();

        fetch_token(&reqwest::Client::new(), &HeaderMap::new(), &anonymous)
            .await
            .unwrap();
        let request = server.await.unwrap();

        assert!(!request.to_ascii_lowercase().contains("authorization:"));
    }

    #[tokio::test]
    async fn test_fetch_token_missing_token() {
        let (url, server) = serve_once("200 OK", r#"{"expires_in":300}"#).await;

        let err = fetch_token(&reqwest::Client::new(), &HeaderMap::new(), &opts(url))
            .await
            .unwrap_err();
        server.await.unwrap();

        assert!(matches!(err, DiffError::NoToken));
    }

    #[tokio::test]
    async fn test_fetch_token_unexpected_status() {
        let (url, server) = serve_once("401 Unauthorized", r#"{"errors":["denied"]}"#).await;

        let err = fetch_token(&reqwest::Client::new(), &HeaderMap::new(), &opts(url))
            .await
            .unwrap_err();
        server.await.unwrap();

        match err {
            DiffError::UnexpectedStatus {
                status_code, body, ..
            } => {
                assert_eq!(status_code, 401);
                assert_eq!(body, br#"{"errors":["denied"]}"#);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_token_with_oauth_password_grant() {
        let (url, server) = serve_once("200 OK", r#"{"access_token":"oauth-token"}"#).await;

        let token = fetch_token_with_oauth(
            &reqwest::Client::new(),
            &HeaderMap::new(),
            "a3s-diff",
            &opts(url),
        )
        .await
        .unwrap();
        let request = server.await.unwrap();

        assert_eq!(token, "oauth-token");
        assert!(request.starts_with("POST /token"));
        assert!(request.contains("grant_type=password"));
        assert!(request.contains("username=alice"));
        assert!(request.contains("client_id=a3s-diff"));
    }

    #[tokio::test]
    async fn test_fetch_token_with_oauth_refresh_grant() {
        let (url, server) = serve_once("200 OK", r#"{"access_token":"refreshed"}"#).await;
        let mut refresh = opts(url);
        refresh.username.clear();

        let token =
            fetch_token_with_oauth(&reqwest::Client::new(), &HeaderMap::new(), "cli", &refresh)
                .await
                .unwrap();
        let request = server.await.unwrap();

        assert_eq!(token, "refreshed");
        assert!(request.contains("grant_type=refresh_token"));
        assert!(request.contains("refresh_token=s3cret"));
    }
}
