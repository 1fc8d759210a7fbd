// Ticket-based authentication.
//
// `POST /access/ticket` returns a session ticket and a CSRF prevention
// token; both are stored on the client. The ticket rides on subsequent
// requests as the `PVEAuthCookie` cookie, the CSRF token as a header on
// mutating requests.

use secrecy::{ExposeSecret, SecretString};
use tracing::debug;

use crate::client::Client;
use crate::error::Error;

impl Client {
    /// Authenticate with username and password.
    ///
    /// The username carries its realm (e.g. `root@pam`). On success the
    /// ticket and CSRF token are stored and used for all subsequent
    /// requests until the ticket expires.
    pub async fn login(&self, username: &str, password: &SecretString) -> Result<(), Error> {
        let url = self.api_url("/access/ticket")?;
        debug!("logging in at {}", url);

        let form = [
            ("username", username),
            ("password", password.expose_secret()),
        ];
        let resp = self
            .http()
            .post(url)
            .form(&form)
            .send()
            .await
            .map_err(Error::Transport)?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::Authentication {
                message: format!("login failed (HTTP {status}): {body}"),
            });
        }

        let envelope: serde_json::Value = resp.json().await.map_err(Error::Transport)?;
        let data = envelope.get("data").and_then(|d| d.as_object());
        let ticket = data
            .and_then(|d| d.get("ticket"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| Error::Authentication {
                message: "login response carried no ticket".into(),
            })?;
        let csrf = data
            .and_then(|d| d.get("CSRFPreventionToken"))
            .and_then(|t| t.as_str())
            .ok_or_else(|| Error::Authentication {
                message: "login response carried no CSRF prevention token".into(),
            })?;

        self.set_session(ticket.to_owned(), csrf.to_owned());
        debug!("login successful");
        Ok(())
    }
}
