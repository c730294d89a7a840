//! Session state for one upload -> analyze -> display cycle, plus the
//! bounded analysis history.

use std::collections::VecDeque;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::analysis::{AnalysisResult, Analyzer};
use crate::error::{AnalysisError, ErrorKind};
use crate::image_data::EncodedImage;

pub const HISTORY_LIMIT: usize = 10;
pub const FAILURE_MESSAGE: &str = "Failed to analyze image. Please try again.";

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryItem {
    pub id: String,
    pub image_url: EncodedImage,
    pub result: AnalysisResult,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

impl HistoryItem {
    fn new(image_url: EncodedImage, result: AnalysisResult) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            image_url,
            result,
            timestamp: Utc::now(),
        }
    }
}

/// Most-recent-first list capped at [`HISTORY_LIMIT`]; the oldest entry falls
/// off when a new one is pushed onto a full list.
#[derive(Debug, Default, Clone, Serialize)]
#[serde(transparent)]
pub struct History {
    items: VecDeque<HistoryItem>,
}

impl History {
    pub fn push_front(&mut self, item: HistoryItem) {
        self.items.push_front(item);
        self.items.truncate(HISTORY_LIMIT);
    }

    pub fn get(&self, id: &str) -> Option<&HistoryItem> {
        self.items.iter().find(|item| item.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HistoryItem> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Phase {
    Idle,
    ImageSelected,
    Analyzing,
    ResultShown,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AnalyzeRejected {
    #[error("no image selected")]
    NoImage,
    #[error("an analysis is already in progress")]
    AlreadyAnalyzing,
}

/// Issued when an analysis starts; must be handed back on completion.
#[derive(Debug)]
pub struct AnalysisTicket {
    generation: u64,
    image: EncodedImage,
}

impl AnalysisTicket {
    pub fn image(&self) -> &EncodedImage {
        &self.image
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum Completion {
    Succeeded,
    Failed,
    /// The displayed image changed while the request was outstanding; the
    /// outcome was dropped.
    Stale,
}

/// Read-only view handed to the presentation layer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub phase: Phase,
    pub selected_image: Option<EncodedImage>,
    pub is_analyzing: bool,
    pub result: Option<AnalysisResult>,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub history: History,
}

#[derive(Debug, Default)]
pub struct Session {
    selected_image: Option<EncodedImage>,
    result: Option<AnalysisResult>,
    error: Option<&'static str>,
    error_kind: Option<ErrorKind>,
    history: History,
    // Bumped whenever the displayed image changes; a response is only shown
    // if its ticket carries the current generation.
    generation: u64,
    in_flight: bool,
}

impl Session {
    pub fn phase(&self) -> Phase {
        if self.in_flight {
            Phase::Analyzing
        } else if self.error.is_some() {
            Phase::Failed
        } else if self.result.is_some() {
            Phase::ResultShown
        } else if self.selected_image.is_some() {
            Phase::ImageSelected
        } else {
            Phase::Idle
        }
    }

    pub fn is_analyzing(&self) -> bool {
        self.in_flight
    }

    pub fn result(&self) -> Option<&AnalysisResult> {
        self.result.as_ref()
    }

    pub fn history(&self) -> &History {
        &self.history
    }

    pub fn select_image(&mut self, image: EncodedImage) {
        self.selected_image = Some(image);
        self.result = None;
        self.clear_error();
        self.generation += 1;
    }

    pub fn clear_image(&mut self) {
        self.selected_image = None;
        self.result = None;
        self.clear_error();
        self.generation += 1;
    }

    pub fn begin_analysis(&mut self) -> Result<AnalysisTicket, AnalyzeRejected> {
        if self.in_flight {
            return Err(AnalyzeRejected::AlreadyAnalyzing);
        }
        let image = self.selected_image.clone().ok_or(AnalyzeRejected::NoImage)?;
        self.clear_error();
        self.in_flight = true;
        Ok(AnalysisTicket {
            generation: self.generation,
            image,
        })
    }

    pub fn complete_analysis(
        &mut self,
        ticket: AnalysisTicket,
        outcome: Result<AnalysisResult, AnalysisError>,
    ) -> Completion {
        self.in_flight = false;
        if ticket.generation != self.generation {
            return Completion::Stale;
        }
        match outcome {
            Ok(result) => {
                self.history
                    .push_front(HistoryItem::new(ticket.image, result.clone()));
                self.result = Some(result);
                Completion::Succeeded
            }
            Err(err) => {
                self.error = Some(FAILURE_MESSAGE);
                self.error_kind = Some(err.kind());
                Completion::Failed
            }
        }
    }

    /// Restores a past analysis as the current display. Returns `None` for
    /// an unknown id.
    pub fn select_history(&mut self, id: &str) -> Option<()> {
        let item = self.history.get(id)?.clone();
        self.selected_image = Some(item.image_url);
        self.result = Some(item.result);
        self.clear_error();
        self.generation += 1;
        Some(())
    }

    /// Releases the in-flight guard for a request whose task died before
    /// completing. Reported as a failure unless the image changed meanwhile.
    pub fn abandon_analysis(&mut self, generation: u64) {
        if !self.in_flight {
            return;
        }
        self.in_flight = false;
        if generation == self.generation {
            self.error = Some(FAILURE_MESSAGE);
            self.error_kind = Some(ErrorKind::Service);
        }
    }

    /// Back to a fresh session. An outstanding request still holds the
    /// single-flight guard until it returns, and its outcome is dropped.
    pub fn reset(&mut self) {
        self.selected_image = None;
        self.result = None;
        self.clear_error();
        self.history.clear();
        self.generation += 1;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase(),
            selected_image: self.selected_image.clone(),
            is_analyzing: self.in_flight,
            result: self.result.clone(),
            error: self.error.map(str::to_string),
            error_kind: self.error_kind,
            history: self.history.clone(),
        }
    }

    fn clear_error(&mut self) {
        self.error = None;
        self.error_kind = None;
    }
}

/// Owns the session and drives the analysis client.
pub struct SessionController {
    session: Arc<Mutex<Session>>,
    analyzer: Arc<dyn Analyzer>,
}

impl SessionController {
    pub fn new(analyzer: Arc<dyn Analyzer>) -> Self {
        Self {
            session: Arc::new(Mutex::new(Session::default())),
            analyzer,
        }
    }

    pub async fn snapshot(&self) -> SessionSnapshot {
        self.session.lock().await.snapshot()
    }

    pub async fn select_image(&self, image: EncodedImage) -> SessionSnapshot {
        let mut session = self.session.lock().await;
        info!(mime_type = image.mime_type(), "image selected");
        session.select_image(image);
        session.snapshot()
    }

    pub async fn clear_image(&self) -> SessionSnapshot {
        let mut session = self.session.lock().await;
        session.clear_image();
        session.snapshot()
    }

    pub async fn select_history(&self, id: &str) -> Option<SessionSnapshot> {
        let mut session = self.session.lock().await;
        session.select_history(id)?;
        Some(session.snapshot())
    }

    pub async fn reset(&self) -> SessionSnapshot {
        let mut session = self.session.lock().await;
        session.reset();
        info!("session reset");
        session.snapshot()
    }

    pub async fn current_prompt(&self) -> Option<String> {
        let session = self.session.lock().await;
        session.result().map(|result| result.video_prompt.clone())
    }

    /// Runs one analysis of the selected image. The request and its
    /// completion run on a spawned task, so a caller that goes away (a
    /// dropped HTTP request) cannot leave the session stuck in flight.
    pub async fn analyze(&self) -> Result<SessionSnapshot, AnalyzeRejected> {
        let ticket = {
            let mut session = self.session.lock().await;
            session.begin_analysis().map_err(|rejected| {
                debug!(%rejected, "analyze rejected");
                rejected
            })?
        };
        let generation = ticket.generation;

        let session = self.session.clone();
        let analyzer = self.analyzer.clone();
        let task = tokio::spawn(async move {
            let outcome = run(analyzer.as_ref(), ticket.image()).await;

            let mut session = session.lock().await;
            if let Err(err) = &outcome {
                error!(error = %err, kind = ?err.kind(), "image analysis failed");
            }
            match session.complete_analysis(ticket, outcome) {
                Completion::Succeeded => {
                    info!(history = session.history().len(), "analysis complete");
                }
                Completion::Stale => {
                    info!("discarding analysis for an image that is no longer selected");
                }
                Completion::Failed => {}
            }
            session.snapshot()
        });

        match task.await {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                error!(error = %err, "analysis task did not finish");
                let mut session = self.session.lock().await;
                session.abandon_analysis(generation);
                Ok(session.snapshot())
            }
        }
    }
}

async fn run(
    analyzer: &dyn Analyzer,
    image: &EncodedImage,
) -> Result<AnalysisResult, AnalysisError> {
    let bytes = image.decode()?;
    analyzer.analyze(&bytes, image.mime_type()).await
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::image_data::tests::png;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    pub(crate) fn sample_result(tag: &str) -> AnalysisResult {
        AnalysisResult {
            concept: format!("c-{tag}"),
            video_prompt: format!("p-{tag}"),
            style_keywords: vec!["x".to_string()],
            suggested_motion: "pan".to_string(),
            lens_type: "wide".to_string(),
            cinematographic_style: "static".to_string(),
        }
    }

    /// Replays queued outcomes; optionally holds each call until released.
    #[derive(Default)]
    pub(crate) struct ScriptedAnalyzer {
        outcomes: std::sync::Mutex<VecDeque<Result<AnalysisResult, AnalysisError>>>,
        pub(crate) calls: AtomicUsize,
        pub(crate) seen_mime: std::sync::Mutex<Vec<String>>,
        gate: Option<Arc<Notify>>,
        pub(crate) entered: Arc<Notify>,
    }

    impl ScriptedAnalyzer {
        pub(crate) fn new(outcomes: Vec<Result<AnalysisResult, AnalysisError>>) -> Self {
            Self {
                outcomes: std::sync::Mutex::new(outcomes.into()),
                ..Default::default()
            }
        }

        pub(crate) fn gated(mut self, gate: Arc<Notify>) -> Self {
            self.gate = Some(gate);
            self
        }
    }

    #[async_trait]
    impl Analyzer for ScriptedAnalyzer {
        async fn analyze(
            &self,
            _image_bytes: &[u8],
            mime_type: &str,
        ) -> Result<AnalysisResult, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen_mime.lock().unwrap().push(mime_type.to_string());
            self.entered.notify_one();
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(AnalysisError::EmptyResponse))
        }
    }

    fn controller(analyzer: ScriptedAnalyzer) -> (Arc<SessionController>, Arc<ScriptedAnalyzer>) {
        let analyzer = Arc::new(analyzer);
        let controller = Arc::new(SessionController::new(analyzer.clone()));
        (controller, analyzer)
    }

    #[test]
    fn history_keeps_ten_most_recent() {
        let mut history = History::default();
        for i in 0..11u8 {
            history.push_front(HistoryItem::new(png(i), sample_result(&i.to_string())));
        }
        assert_eq!(history.len(), HISTORY_LIMIT);
        let first = history.iter().next().unwrap();
        assert_eq!(first.result.concept, "c-10");
        let last = history.iter().last().unwrap();
        assert_eq!(last.result.concept, "c-1");
    }

    #[test]
    fn begin_requires_an_image_and_no_outstanding_request() {
        let mut session = Session::default();
        assert_eq!(session.begin_analysis().unwrap_err(), AnalyzeRejected::NoImage);
        assert_eq!(session.phase(), Phase::Idle);

        session.select_image(png(1));
        assert_eq!(session.phase(), Phase::ImageSelected);
        let _ticket = session.begin_analysis().unwrap();
        assert_eq!(session.phase(), Phase::Analyzing);
        assert_eq!(
            session.begin_analysis().unwrap_err(),
            AnalyzeRejected::AlreadyAnalyzing
        );
    }

    #[test]
    fn failure_leaves_image_and_previous_result_alone() {
        let mut session = Session::default();
        session.select_image(png(1));
        let ticket = session.begin_analysis().unwrap();
        session.complete_analysis(ticket, Ok(sample_result("a")));

        let ticket = session.begin_analysis().unwrap();
        let completion = session.complete_analysis(ticket, Err(AnalysisError::EmptyResponse));

        assert_eq!(completion, Completion::Failed);
        let snap = session.snapshot();
        assert_eq!(snap.phase, Phase::Failed);
        assert!(!snap.is_analyzing);
        assert_eq!(snap.error.as_deref(), Some(FAILURE_MESSAGE));
        assert_eq!(snap.error_kind, Some(ErrorKind::Service));
        assert_eq!(snap.result, Some(sample_result("a")));
        assert_eq!(snap.selected_image, Some(png(1)));
        assert_eq!(snap.history.len(), 1);
    }

    #[test]
    fn response_for_replaced_image_is_discarded() {
        let mut session = Session::default();
        session.select_image(png(1));
        let ticket = session.begin_analysis().unwrap();
        session.select_image(png(2));

        let completion = session.complete_analysis(ticket, Ok(sample_result("old")));

        assert_eq!(completion, Completion::Stale);
        assert!(!session.is_analyzing());
        assert_eq!(session.result(), None);
        assert!(session.history().is_empty());
        assert_eq!(session.phase(), Phase::ImageSelected);
    }

    fn session_with_one_result() -> Session {
        let mut session = Session::default();
        session.select_image(png(1));
        let ticket = session.begin_analysis().unwrap();
        session.complete_analysis(ticket, Ok(sample_result("1")));
        session
    }

    #[test]
    fn response_after_clear_image_is_discarded() {
        let mut session = session_with_one_result();
        let ticket = session.begin_analysis().unwrap();
        session.clear_image();

        let completion = session.complete_analysis(ticket, Ok(sample_result("late")));

        assert_eq!(completion, Completion::Stale);
        assert!(!session.is_analyzing());
        assert_eq!(session.result(), None);
        assert_eq!(session.history().len(), 1);
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[test]
    fn response_after_history_select_is_discarded() {
        let mut session = session_with_one_result();
        let id = session.history().iter().next().unwrap().id.clone();
        let ticket = session.begin_analysis().unwrap();
        session.select_history(&id).unwrap();

        let completion = session.complete_analysis(ticket, Err(AnalysisError::EmptyResponse));

        assert_eq!(completion, Completion::Stale);
        assert!(!session.is_analyzing());
        assert_eq!(session.result(), Some(&sample_result("1")));
        assert_eq!(session.history().len(), 1);
        assert_eq!(session.phase(), Phase::ResultShown);
    }

    #[test]
    fn response_after_reset_is_discarded() {
        let mut session = session_with_one_result();
        let ticket = session.begin_analysis().unwrap();
        session.reset();
        assert!(session.is_analyzing());

        let completion = session.complete_analysis(ticket, Ok(sample_result("late")));

        assert_eq!(completion, Completion::Stale);
        assert!(!session.is_analyzing());
        assert_eq!(session.result(), None);
        assert!(session.history().is_empty());
        assert_eq!(session.phase(), Phase::Idle);
    }

    #[test]
    fn abandoned_analysis_releases_guard() {
        let mut session = Session::default();
        session.select_image(png(1));
        let ticket = session.begin_analysis().unwrap();

        session.abandon_analysis(ticket.generation);

        assert!(!session.is_analyzing());
        assert_eq!(session.phase(), Phase::Failed);
        assert!(session.begin_analysis().is_ok());
    }

    #[test]
    fn selecting_history_restores_image_and_result() {
        let mut session = Session::default();
        for i in 1..=2u8 {
            session.select_image(png(i));
            let ticket = session.begin_analysis().unwrap();
            session.complete_analysis(ticket, Ok(sample_result(&i.to_string())));
        }
        let older_id = session.history().iter().nth(1).unwrap().id.clone();
        let ticket = session.begin_analysis().unwrap();
        session.complete_analysis(ticket, Err(AnalysisError::EmptyResponse));

        assert!(session.select_history(&older_id).is_some());
        let snap = session.snapshot();
        assert_eq!(snap.selected_image, Some(png(1)));
        assert_eq!(snap.result, Some(sample_result("1")));
        assert_eq!(snap.error, None);
        assert_eq!(snap.phase, Phase::ResultShown);

        assert!(session.select_history("missing").is_none());
    }

    #[test]
    fn reset_returns_to_empty_session() {
        let mut session = Session::default();
        session.select_image(png(1));
        let ticket = session.begin_analysis().unwrap();
        session.complete_analysis(ticket, Ok(sample_result("a")));

        session.reset();

        let snap = session.snapshot();
        assert_eq!(snap.phase, Phase::Idle);
        assert_eq!(snap.selected_image, None);
        assert_eq!(snap.result, None);
        assert_eq!(snap.error, None);
        assert!(!snap.is_analyzing);
        assert!(snap.history.is_empty());
    }

    #[test]
    fn clear_image_drops_image_and_result() {
        let mut session = Session::default();
        session.select_image(png(1));
        let ticket = session.begin_analysis().unwrap();
        session.complete_analysis(ticket, Ok(sample_result("a")));

        session.clear_image();

        assert_eq!(session.phase(), Phase::Idle);
        assert_eq!(session.result(), None);
        assert_eq!(session.history().len(), 1);
    }

    #[tokio::test]
    async fn successful_analysis_records_exact_image_and_result() {
        let (controller, analyzer) =
            controller(ScriptedAnalyzer::new(vec![Ok(sample_result("1"))]));
        controller.select_image(png(7)).await;

        let snap = controller.analyze().await.unwrap();

        assert!(!snap.is_analyzing);
        assert_eq!(snap.error, None);
        assert_eq!(snap.result, Some(sample_result("1")));
        let first = snap.history.iter().next().unwrap();
        assert_eq!(first.image_url, png(7));
        assert_eq!(first.result, sample_result("1"));
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(analyzer.seen_mime.lock().unwrap().as_slice(), ["image/png"]);
    }

    #[tokio::test]
    async fn failed_analysis_sets_error_and_keeps_history_empty() {
        let (controller, _) = controller(ScriptedAnalyzer::new(vec![Err(AnalysisError::Service {
            status: 500,
            message: "boom".to_string(),
        })]));
        controller.select_image(png(1)).await;

        let snap = controller.analyze().await.unwrap();

        assert!(!snap.is_analyzing);
        assert_eq!(snap.result, None);
        assert_eq!(snap.error.as_deref(), Some(FAILURE_MESSAGE));
        assert!(snap.history.is_empty());
    }

    #[tokio::test]
    async fn undecodable_image_is_tagged_as_decode_failure() {
        let (controller, analyzer) = controller(ScriptedAnalyzer::default());
        controller
            .select_image(EncodedImage::parse("data:image/png;base64,%%%").unwrap())
            .await;

        let snap = controller.analyze().await.unwrap();

        assert_eq!(snap.error_kind, Some(ErrorKind::ImageDecode));
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn eleven_analyses_evict_the_first() {
        let outcomes = (1..=11).map(|i| Ok(sample_result(&i.to_string()))).collect();
        let (controller, _) = controller(ScriptedAnalyzer::new(outcomes));

        for i in 1..=11u8 {
            controller.select_image(png(i)).await;
            controller.analyze().await.unwrap();
        }

        let snap = controller.snapshot().await;
        let images: Vec<_> = snap
            .history
            .iter()
            .map(|item| item.image_url.clone())
            .collect();
        let expected: Vec<_> = (2..=11u8).rev().map(png).collect();
        assert_eq!(images, expected);
    }

    #[tokio::test]
    async fn second_trigger_while_analyzing_is_a_no_op() {
        let gate = Arc::new(Notify::new());
        let (controller, analyzer) = controller(
            ScriptedAnalyzer::new(vec![Ok(sample_result("1"))]).gated(gate.clone()),
        );
        controller.select_image(png(1)).await;

        let first = tokio::spawn({
            let controller = controller.clone();
            async move { controller.analyze().await }
        });
        analyzer.entered.notified().await;

        let before = controller.snapshot().await;
        assert!(before.is_analyzing);
        assert_eq!(before.phase, Phase::Analyzing);
        assert_eq!(
            controller.analyze().await.unwrap_err(),
            AnalyzeRejected::AlreadyAnalyzing
        );
        let after = controller.snapshot().await;
        assert!(after.is_analyzing);
        assert_eq!(after.result, before.result);

        gate.notify_one();
        let snap = first.await.unwrap().unwrap();
        assert_eq!(snap.result, Some(sample_result("1")));
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_caller_does_not_strand_the_session() {
        let gate = Arc::new(Notify::new());
        let (controller, analyzer) = controller(
            ScriptedAnalyzer::new(vec![Ok(sample_result("1")), Ok(sample_result("2"))])
                .gated(gate.clone()),
        );
        controller.select_image(png(1)).await;

        let caller = tokio::spawn({
            let controller = controller.clone();
            async move { controller.analyze().await }
        });
        analyzer.entered.notified().await;
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());

        controller.reset().await;
        controller.select_image(png(2)).await;
        gate.notify_one();
        tokio::time::timeout(Duration::from_secs(5), async {
            while controller.snapshot().await.is_analyzing {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        let snap = controller.snapshot().await;
        assert_eq!(snap.phase, Phase::ImageSelected);
        assert!(snap.history.is_empty());

        gate.notify_one();
        let snap = controller.analyze().await.unwrap();
        assert_eq!(snap.result, Some(sample_result("2")));
        assert_eq!(snap.history.iter().next().unwrap().image_url, png(2));
        assert_eq!(analyzer.calls.load(Ordering::SeqCst), 2);
    }
}
