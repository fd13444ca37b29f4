//! Login endpoint: `GET /login?password=<string>`.
//!
//! The only path that bypasses authentication. A correct password issues
//! a fresh token pair as two hardened cookies and returns a confirmation
//! page whose continuation link embeds [`SESSION_KEY_PLACEHOLDER`]; the
//! forwarding engine substitutes the real upstream session key when that
//! link is followed.

use bytes::Bytes;
use http::{StatusCode, header};
use http_body_util::Full;
use hyper::{Request, Response};
use tracing::info;

use crate::auth::{self, SIGNATURE_COOKIE, USER_KEY_COOKIE};
use crate::config::GateConfig;
use crate::error::GateResult;

/// Placeholder embedded in the continuation link and rewritten by the
/// forwarding engine into the configured upstream session key.
pub const SESSION_KEY_PLACEHOLDER: &str = "CONVGATE_SESSION_KEY";

fn confirmation_page(extra_html: &str) -> String {
    format!(
        r#"<html>
    <body style="text-align: center; padding-top: 50px; font-family: Arial, sans-serif;">
        <h2>Account Created Successfully!</h2>
        <p><a href="/login_token?session_key={SESSION_KEY_PLACEHOLDER}">Click here to continue</a></p>
        <p style="color: #666; font-size: 0.9em;">Note: First load may take a few moments. Subsequent loads will be faster once cached.<br>If you encounter any issues, try refreshing your browser.</p>
        {extra_html}
    </body>
</html>"#
    )
}

fn password_param(query: Option<&str>) -> Option<String> {
    let query = query?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "password")
        .map(|(_, value)| value.into_owned())
}

/// Handle the login request.
pub fn handle_login<B>(req: &Request<B>, config: &GateConfig) -> GateResult<Response<Full<Bytes>>> {
    let presented = password_param(req.uri().query());
    if presented.as_deref() != Some(config.password.as_str()) {
        return Ok(Response::builder()
            .status(StatusCode::UNAUTHORIZED)
            .header(header::CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from("Invalid password")))?);
    }

    // Already carrying a valid token: nothing to issue.
    if auth::identity_of(req, &config.signing_secret).is_some() {
        return Ok(Response::builder()
            .status(StatusCode::FOUND)
            .header(header::LOCATION, "/")
            .body(Full::new(Bytes::new()))?);
    }

    let pair = auth::issue(&config.signing_secret);
    info!("issued new token pair");

    Ok(Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(
            header::SET_COOKIE,
            auth::set_cookie_value(USER_KEY_COOKIE, &pair.user_key),
        )
        .header(
            header::SET_COOKIE,
            auth::set_cookie_value(SIGNATURE_COOKIE, &pair.signature),
        )
        .body(Full::new(Bytes::from(confirmation_page(
            &config.login_extra_html,
        ))))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> GateConfig {
        GateConfig {
            upstream_host: "chat.example.com".to_string(),
            password: "hunter2".to_string(),
            signing_secret: "secret".to_string(),
            ..GateConfig::default()
        }
    }

    fn login_request(query: &str) -> Request<()> {
        Request::builder()
            .uri(format!("/login{query}"))
            .body(())
            .unwrap()
    }

    #[test]
    fn test_wrong_password_is_401() {
        let config = config();
        for query in ["", "?password=wrong", "?other=hunter2"] {
            let resp = handle_login(&login_request(query), &config).unwrap();
            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED, "query {query:?}");
        }
    }

    #[test]
    fn test_correct_password_sets_both_cookies() {
        let config = config();
        let resp = handle_login(&login_request("?password=hunter2"), &config).unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let cookies: Vec<_> = resp
            .headers()
            .get_all(header::SET_COOKIE)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(cookies.len(), 2);
        assert!(cookies[0].starts_with("user-key="));
        assert!(cookies[1].starts_with("signature="));
        for cookie in &cookies {
            assert!(cookie.contains("SameSite=Strict"), "{cookie}");
        }
    }

    #[test]
    fn test_confirmation_page_has_continuation_placeholder() {
        let mut config = config();
        config.login_extra_html = "<p>extra</p>".to_string();
        let resp = handle_login(&login_request("?password=hunter2"), &config).unwrap();

        let page = confirmation_page(&config.login_extra_html);
        assert!(page.contains(SESSION_KEY_PLACEHOLDER));
        assert!(page.contains("<p>extra</p>"));
        // Sanity: the handler serves HTML.
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/html; charset=utf-8"
        );
    }

    #[test]
    fn test_valid_token_redirects_home() {
        let config = config();
        let pair = auth::issue(&config.signing_secret);
        let req = Request::builder()
            .uri("/login?password=hunter2")
            .header(
                header::COOKIE,
                format!(
                    "{USER_KEY_COOKIE}={}; {SIGNATURE_COOKIE}={}",
                    pair.user_key, pair.signature
                ),
            )
            .body(())
            .unwrap();

        let resp = handle_login(&req, &config).unwrap();
        assert_eq!(resp.status(), StatusCode::FOUND);
        assert_eq!(resp.headers().get(header::LOCATION).unwrap(), "/");
        assert!(resp.headers().get(header::SET_COOKIE).is_none());
    }

    #[test]
    fn test_password_param_url_decoding() {
        assert_eq!(
            password_param(Some("password=p%40ss%20word")),
            Some("p@ss word".to_string())
        );
        assert_eq!(password_param(None), None);
    }
}
