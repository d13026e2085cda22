//! Browser session abstraction used by the page field fetchers.
//!
//! A session is one exclusive browser: every call may depend on the page the
//! previous call left behind, so it is always taken by `&mut`. Callers must
//! navigate explicitly before reading anything.

pub mod webdriver;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::SessionError;

pub use webdriver::{Browser, WebDriverSession};

/// How to find an element on the current page.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Locator {
    XPath(String),
    Css(String),
}

impl Locator {
    pub fn xpath(expr: impl Into<String>) -> Self {
        Locator::XPath(expr.into())
    }

    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css(selector.into())
    }

    /// WebDriver `using` strategy and value.
    pub fn strategy(&self) -> (&'static str, &str) {
        match self {
            Locator::XPath(expr) => ("xpath", expr),
            Locator::Css(selector) => ("css selector", selector),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::XPath(expr) => write!(f, "xpath:{expr}"),
            Locator::Css(selector) => write!(f, "css:{selector}"),
        }
    }
}

/// Opaque reference to an element on the page that was current when it was
/// located. Invalid after the next navigation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementHandle(pub String);

#[async_trait]
pub trait NavigationSession: Send {
    async fn navigate(&mut self, url: &str) -> Result<(), SessionError>;

    /// Block up to `timeout` for `locator` to match an element.
    async fn wait_and_locate(
        &mut self,
        locator: &Locator,
        timeout: Duration,
    ) -> Result<ElementHandle, SessionError>;

    async fn text_of(&mut self, element: &ElementHandle) -> Result<String, SessionError>;

    async fn attribute_of(
        &mut self,
        element: &ElementHandle,
        name: &str,
    ) -> Result<Option<String>, SessionError>;

    async fn click(&mut self, element: &ElementHandle) -> Result<(), SessionError>;
}
