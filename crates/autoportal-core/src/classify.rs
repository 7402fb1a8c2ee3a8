//! Response classification.
//!
//! A single closed function replaces the scattered "is this a login
//! redirect / is this an error page" checks: given the response status, the
//! redirect target and a body sample it decides how the orchestrator should
//! react. Pure and testable without a live portal.

/// Outcome classification for one portal response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Success,
    /// Authentication artifacts rejected; refresh and retry.
    Unauthorized,
    /// Timeout, reset or server-side failure; retry with backoff.
    Transient,
    /// Structurally invalid request; do not retry.
    ClientError,
}

/// Classify a portal response.
///
/// Status `0` stands for a transport-level failure (no response at all).
/// Redirects to a login/signin page mean the session is gone; any other
/// redirect is treated as success, since the portal redirects after
/// accepted form posts.
pub fn classify(status: u16, location: Option<&str>, body_sample: &str) -> FailureKind {
    if status == 0 {
        return FailureKind::Transient;
    }
    if status == 401 || status == 403 {
        return FailureKind::Unauthorized;
    }
    if (300..400).contains(&status) {
        if let Some(target) = location {
            let target = target.to_ascii_lowercase();
            if target.contains("login") || target.contains("signin") || target.contains("auth") {
                return FailureKind::Unauthorized;
            }
        }
        return FailureKind::Success;
    }
    if status == 408 || status == 429 || status >= 500 {
        return FailureKind::Transient;
    }
    if (400..500).contains(&status) {
        return FailureKind::ClientError;
    }

    // 2xx can still be a served login page.
    let body = body_sample.to_ascii_lowercase();
    if body.contains("session expired")
        || body.contains("please log in")
        || body.contains("type=\"password\"")
    {
        return FailureKind::Unauthorized;
    }
    FailureKind::Success
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_success() {
        assert_eq!(classify(200, None, "{\"plan\":\"basic\"}"), FailureKind::Success);
    }

    #[test]
    fn auth_statuses_are_unauthorized() {
        assert_eq!(classify(401, None, ""), FailureKind::Unauthorized);
        assert_eq!(classify(403, None, ""), FailureKind::Unauthorized);
    }

    #[test]
    fn login_redirect_is_unauthorized() {
        assert_eq!(
            classify(302, Some("https://portal.example.com/Login?next=%2F"), ""),
            FailureKind::Unauthorized
        );
        assert_eq!(
            classify(302, Some("/auth/session"), ""),
            FailureKind::Unauthorized
        );
    }

    #[test]
    fn post_submit_redirect_is_success() {
        assert_eq!(
            classify(302, Some("/dashboard?saved=1"), ""),
            FailureKind::Success
        );
    }

    #[test]
    fn server_failures_and_timeouts_are_transient() {
        assert_eq!(classify(0, None, ""), FailureKind::Transient);
        assert_eq!(classify(408, None, ""), FailureKind::Transient);
        assert_eq!(classify(429, None, ""), FailureKind::Transient);
        assert_eq!(classify(503, None, ""), FailureKind::Transient);
    }

    #[test]
    fn other_client_errors_are_terminal() {
        assert_eq!(classify(400, None, ""), FailureKind::ClientError);
        assert_eq!(classify(404, None, ""), FailureKind::ClientError);
        assert_eq!(classify(422, None, ""), FailureKind::ClientError);
    }

    #[test]
    fn served_login_page_is_unauthorized() {
        let body = "<form><input type=\"password\" name=\"pw\"></form>";
        assert_eq!(classify(200, None, body), FailureKind::Unauthorized);
        assert_eq!(
            classify(200, None, "Session expired, please log in again"),
            FailureKind::Unauthorized
        );
    }
}
