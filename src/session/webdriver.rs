use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info};

use super::{ElementHandle, Locator, NavigationSession};
use crate::error::SessionError;

/// W3C key under which element references are returned.
const ELEMENT_KEY: &str = "element-6066-11e4-a52f-4ce936f5d5b8";
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Browser {
    #[default]
    Firefox,
    Chrome,
}

/// A browser driven over the W3C WebDriver HTTP protocol
/// (geckodriver, chromedriver, or a Selenium grid).
pub struct WebDriverSession {
    client: reqwest::Client,
    base_url: String,
    session_id: String,
}

impl WebDriverSession {
    /// Open a new browser session. Failure here is the one error that ends a
    /// whole harvest run.
    pub async fn start(
        base_url: &str,
        browser: Browser,
        headless: bool,
    ) -> Result<Self, SessionError> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|e| SessionError::Unavailable(e.to_string()))?;
        let base_url = base_url.trim_end_matches('/').to_string();

        let body = json!({ "capabilities": { "alwaysMatch": capabilities(browser, headless) } });
        let resp = client
            .post(format!("{base_url}/session"))
            .json(&body)
            .send()
            .await
            .map_err(|e| SessionError::Unavailable(format!("{base_url}: {e}")))?;
        let value = read_value(resp)
            .await
            .map_err(|e| SessionError::Unavailable(e.to_string()))?;

        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| SessionError::Unavailable("response carries no sessionId".into()))?
            .to_string();

        info!(%session_id, ?browser, headless, "Browser session started");
        Ok(Self {
            client,
            base_url,
            session_id,
        })
    }

    /// Close the browser.
    pub async fn quit(self) -> Result<(), SessionError> {
        let resp = self.client.delete(self.endpoint("")).send().await?;
        read_value(resp).await?;
        info!(session_id = %self.session_id, "Browser session closed");
        Ok(())
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/session/{}{}", self.base_url, self.session_id, path)
    }

    /// One lookup attempt; `None` when nothing matches yet.
    async fn find(&self, locator: &Locator) -> Result<Option<ElementHandle>, SessionError> {
        let (using, value) = locator.strategy();
        let resp = self
            .client
            .post(self.endpoint("/element"))
            .json(&json!({ "using": using, "value": value }))
            .send()
            .await?;

        match read_value(resp).await {
            Ok(found) => found
                .get(ELEMENT_KEY)
                .and_then(Value::as_str)
                .map(|id| Some(ElementHandle(id.to_string())))
                .ok_or_else(|| SessionError::Protocol {
                    status: 200,
                    message: format!("element reference missing for {locator}"),
                }),
            Err(SessionError::Protocol { message, .. }) if message.starts_with("no such element") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl NavigationSession for WebDriverSession {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError> {
        debug!(url, "Navigating");
        let sent = self
            .client
            .post(self.endpoint("/url"))
            .json(&json!({ "url": url }))
            .send()
            .await;
        let result = match sent {
            Ok(resp) => read_value(resp).await.map(|_| ()),
            Err(e) => Err(e.into()),
        };
        result.map_err(|e| SessionError::Navigation {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }

    async fn wait_and_locate(
        &mut self,
        locator: &Locator,
        timeout: Duration,
    ) -> Result<ElementHandle, SessionError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(element) = self.find(locator).await? {
                return Ok(element);
            }
            if Instant::now() >= deadline {
                return Err(SessionError::Timeout {
                    locator: locator.to_string(),
                    after: timeout,
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    async fn text_of(&mut self, element: &ElementHandle) -> Result<String, SessionError> {
        let resp = self
            .client
            .get(self.endpoint(&format!("/element/{}/text", element.0)))
            .send()
            .await?;
        let value = read_value(resp).await.map_err(|e| stale(e, element))?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn attribute_of(
        &mut self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, SessionError> {
        let resp = self
            .client
            .get(self.endpoint(&format!("/element/{}/attribute/{}", element.0, name)))
            .send()
            .await?;
        let value = read_value(resp).await.map_err(|e| stale(e, element))?;
        Ok(value.as_str().map(str::to_string))
    }

    async fn click(&mut self, element: &ElementHandle) -> Result<(), SessionError> {
        let resp = self
            .client
            .post(self.endpoint(&format!("/element/{}/click", element.0)))
            .json(&json!({}))
            .send()
            .await?;
        read_value(resp).await.map_err(|e| stale(e, element))?;
        Ok(())
    }
}

fn capabilities(browser: Browser, headless: bool) -> Value {
    match browser {
        Browser::Firefox => {
            let args: Vec<&str> = if headless { vec!["-headless"] } else { vec![] };
            json!({ "browserName": "firefox", "moz:firefoxOptions": { "args": args } })
        }
        Browser::Chrome => {
            let mut args = vec!["--no-sandbox", "--disable-dev-shm-usage"];
            if headless {
                args.push("--headless=new");
            }
            json!({ "browserName": "chrome", "goog:chromeOptions": { "args": args } })
        }
    }
}

/// Unwrap the `value` member of a WebDriver response, turning W3C error
/// payloads into `SessionError::Protocol` ("<error>: <message>").
async fn read_value(resp: reqwest::Response) -> Result<Value, SessionError> {
    let status = resp.status();
    let body: Value = resp.json().await?;
    let value = body.get("value").cloned().unwrap_or(Value::Null);

    if status.is_success() {
        return Ok(value);
    }
    let error = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();
    Err(SessionError::Protocol {
        status: status.as_u16(),
        message: format!("{error}: {message}"),
    })
}

fn stale(err: SessionError, element: &ElementHandle) -> SessionError {
    match err {
        SessionError::Protocol { ref message, .. }
            if message.starts_with("stale element reference")
                || message.starts_with("no such element") =>
        {
            SessionError::StaleElement(element.0.clone())
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn firefox_headless_capabilities() {
        let caps = capabilities(Browser::Firefox, true);
        assert_eq!(caps["browserName"], "firefox");
        assert_eq!(caps["moz:firefoxOptions"]["args"][0], "-headless");
    }

    #[test]
    fn chrome_headed_has_no_headless_flag() {
        let caps = capabilities(Browser::Chrome, false);
        let args = caps["goog:chromeOptions"]["args"].as_array().unwrap();
        assert!(args.iter().all(|a| a != "--headless=new"));
    }

    #[test]
    fn stale_maps_protocol_errors() {
        let err = SessionError::Protocol {
            status: 404,
            message: "stale element reference: element is not attached".into(),
        };
        let handle = ElementHandle("abc".into());
        assert!(matches!(stale(err, &handle), SessionError::StaleElement(id) if id == "abc"));
    }

    #[test]
    fn locator_strategies() {
        assert_eq!(Locator::xpath("//h1").strategy(), ("xpath", "//h1"));
        assert_eq!(Locator::css("h1.title").strategy(), ("css selector", "h1.title"));
        assert_eq!(Locator::xpath("//h1").to_string(), "xpath://h1");
    }
}
