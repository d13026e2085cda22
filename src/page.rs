//! Field fetchers for a Google Patents result page.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::download::AssetDownloader;
use crate::error::{DownloadError, SessionError};
use crate::parser::{extract_citations, extract_codes};
use crate::pipeline::{FetchOutcome, Field, FieldSource, FieldValue, ImageAsset, Target};
use crate::session::{Locator, NavigationSession};

const RESULT_ROOT: &str =
    "/html/body/search-app/search-result/search-ui/div/div/div/div/div/result-container/patent-result/div";

const CITATIONS_HEADING: &str = "Patent Citations";

/// Element locations on the result page.
pub struct Selectors {
    pub title: Locator,
    pub abstract_text: Locator,
    pub citations_title: Locator,
    pub citations: Locator,
    pub classification_thumbnail: Locator,
    pub classification: Locator,
    pub first_claim: Locator,
    pub image_thumbnail: Locator,
    pub front_image: Locator,
}

impl Default for Selectors {
    fn default() -> Self {
        let at = |suffix: &str| Locator::xpath(format!("{RESULT_ROOT}{suffix}"));
        Self {
            title: at("/div[1]/div/h1"),
            abstract_text: at(
                "/div/div/div[1]/div[1]/section[1]/patent-text/div/section/abstract/div",
            ),
            citations_title: at("/div/div/div[3]/h3[1]"),
            citations: at("/div/div/div[3]/div[1]"),
            classification_thumbnail: at(
                "/div/div/div[1]/div[1]/section[3]/classification-viewer/div/div/div[1]",
            ),
            classification: at("/div/div/div[1]/div[1]/section[3]"),
            first_claim: at(
                "/div/div/div[2]/div[2]/section/patent-text/div/section/div/div[1]/div",
            ),
            image_thumbnail: at("/div/div/div[1]/div[1]/section[2]/image-carousel/div/img[1]"),
            front_image: at("/div[2]/div[2]/image-viewer/div/div[2]/div[1]/img"),
        }
    }
}

/// Element wait budgets. Claims, the classification viewer and the image
/// viewer render later than the header fields.
#[derive(Debug, Clone, Copy)]
pub struct Waits {
    pub short: Duration,
    pub long: Duration,
}

impl Default for Waits {
    fn default() -> Self {
        Self {
            short: Duration::from_secs(5),
            long: Duration::from_secs(10),
        }
    }
}

/// Build the page URL for a publication number.
pub fn patent_url(base_url: &str, id: &str) -> String {
    format!("{}/patent/{id}/en?oq={id}", base_url.trim_end_matches('/'))
}

enum FetchError {
    Session(SessionError),
    Download(DownloadError),
}

impl From<SessionError> for FetchError {
    fn from(err: SessionError) -> Self {
        FetchError::Session(err)
    }
}

impl From<DownloadError> for FetchError {
    fn from(err: DownloadError) -> Self {
        FetchError::Download(err)
    }
}

/// One browser session plus a downloader, exposing each page field as a
/// pipeline fetcher. Every fetch starts by navigating to the target page.
pub struct PatentPage<S, D> {
    session: S,
    downloader: D,
    selectors: Selectors,
    waits: Waits,
}

impl<S: NavigationSession, D: AssetDownloader> PatentPage<S, D> {
    pub fn new(session: S, downloader: D, waits: Waits) -> Self {
        Self {
            session,
            downloader,
            selectors: Selectors::default(),
            waits,
        }
    }

    pub fn with_selectors(mut self, selectors: Selectors) -> Self {
        self.selectors = selectors;
        self
    }

    /// Hand the session back, e.g. to close it.
    pub fn into_session(self) -> S {
        self.session
    }

    async fn text_at(
        &mut self,
        url: &str,
        locator: &Locator,
        wait: Duration,
    ) -> Result<Option<FieldValue>, FetchError> {
        self.session.navigate(url).await?;
        let element = self.session.wait_and_locate(locator, wait).await?;
        let text = self.session.text_of(&element).await?;
        let text = text.trim();
        Ok((!text.is_empty()).then(|| FieldValue::Text(text.to_string())))
    }

    async fn citations(&mut self, url: &str) -> Result<Option<FieldValue>, FetchError> {
        self.session.navigate(url).await?;
        let heading = self
            .session
            .wait_and_locate(&self.selectors.citations_title, self.waits.short)
            .await?;
        let heading = self.session.text_of(&heading).await?;
        if !heading.trim_start().starts_with(CITATIONS_HEADING) {
            debug!(url, heading = %heading.trim(), "No patent citations section");
            return Ok(None);
        }

        let table = self
            .session
            .wait_and_locate(&self.selectors.citations, self.waits.short)
            .await?;
        let citations = extract_citations(&self.session.text_of(&table).await?);
        // Expansion samples examiner citations; without them the record is useless.
        if citations.examiner_cited.is_empty() {
            return Ok(None);
        }
        Ok(Some(FieldValue::Citations(citations)))
    }

    async fn classification(&mut self, url: &str) -> Result<Option<FieldValue>, FetchError> {
        self.session.navigate(url).await?;

        // Expands the viewer when present; the collapsed section still lists
        // the main codes, so a failed click is not fatal.
        let expanded = match self
            .session
            .wait_and_locate(&self.selectors.classification_thumbnail, self.waits.long)
            .await
        {
            Ok(thumbnail) => self.session.click(&thumbnail).await,
            Err(e) => Err(e),
        };
        if let Err(e) = expanded {
            debug!(url, error = %e, "Classification viewer not expanded");
        }

        let section = self
            .session
            .wait_and_locate(&self.selectors.classification, self.waits.long)
            .await?;
        let codes = extract_codes(&self.session.text_of(&section).await?);
        Ok((!codes.is_empty()).then_some(FieldValue::Codes(codes)))
    }

    async fn front_image(&mut self, url: &str) -> Result<Option<FieldValue>, FetchError> {
        self.session.navigate(url).await?;
        let thumbnail = self
            .session
            .wait_and_locate(&self.selectors.image_thumbnail, self.waits.long)
            .await?;
        self.session.click(&thumbnail).await?;

        let image = self
            .session
            .wait_and_locate(&self.selectors.front_image, self.waits.long)
            .await?;
        let Some(src) = self
            .session
            .attribute_of(&image, "src")
            .await?
            .filter(|s| !s.trim().is_empty())
        else {
            return Ok(None);
        };

        let bytes = self.downloader.download(&src).await?;
        Ok(Some(FieldValue::Image(ImageAsset {
            source_url: src,
            bytes,
        })))
    }
}

#[async_trait]
impl<S: NavigationSession, D: AssetDownloader> FieldSource for PatentPage<S, D> {
    async fn fetch(&mut self, field: Field, target: &Target) -> FetchOutcome {
        let url = target.url.as_str();
        let result = match field {
            Field::Title => {
                let locator = self.selectors.title.clone();
                self.text_at(url, &locator, self.waits.short).await
            }
            Field::Abstract => {
                let locator = self.selectors.abstract_text.clone();
                self.text_at(url, &locator, self.waits.short).await
            }
            Field::FirstClaim => {
                let locator = self.selectors.first_claim.clone();
                self.text_at(url, &locator, self.waits.long).await
            }
            Field::Citations => self.citations(url).await,
            Field::ClassificationCodes => self.classification(url).await,
            Field::FrontImage => self.front_image(url).await,
        };

        match result {
            Ok(Some(value)) => FetchOutcome::Value(value),
            Ok(None) => FetchOutcome::Empty,
            Err(FetchError::Session(SessionError::Timeout { .. })) => FetchOutcome::TimedOut,
            Err(FetchError::Session(e)) => FetchOutcome::Failed(e.to_string()),
            Err(FetchError::Download(e)) => FetchOutcome::Failed(e.to_string()),
        }
    }
}
