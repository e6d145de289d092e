//! In-process `MediaEngine` double.
//!
//! Records every call, hands out sequential object ids, and can be scripted
//! to fail or stall a specific operation. `disconnect` simulates losing the
//! engine: candidate streams end and objects from before the loss become
//! unreachable.

use super::{EngineObject, IceCandidate, MediaEngine};
use crate::errors::{EngineError, EngineOperation};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default SDP answer returned by `process_offer`.
pub const MOCK_SDP_ANSWER: &str = "v=0\r\no=- 0 0 IN IP4 127.0.0.1\r\ns=mock\r\n";

/// Mock media engine for unit testing.
pub struct MockMediaEngine {
    answer: String,
    failing: Option<(EngineOperation, EngineError)>,
    delays: HashMap<EngineOperation, Duration>,
    gathered_candidates: Vec<IceCandidate>,
    unreachable: AtomicBool,
    epoch: AtomicU64,
    next_object: AtomicUsize,
    calls: Mutex<HashMap<EngineOperation, usize>>,
    released: Mutex<Vec<EngineObject>>,
    remote_candidates: Mutex<Vec<IceCandidate>>,
    offers: Mutex<Vec<String>>,
    source_uris: Mutex<Vec<String>>,
    ice_senders: Mutex<HashMap<String, mpsc::UnboundedSender<IceCandidate>>>,
}

impl Default for MockMediaEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MockMediaEngine {
    /// A mock that succeeds at everything.
    #[must_use]
    pub fn new() -> Self {
        Self {
            answer: MOCK_SDP_ANSWER.to_string(),
            failing: None,
            delays: HashMap::new(),
            gathered_candidates: Vec::new(),
            unreachable: AtomicBool::new(false),
            epoch: AtomicU64::new(1),
            next_object: AtomicUsize::new(0),
            calls: Mutex::new(HashMap::new()),
            released: Mutex::new(Vec::new()),
            remote_candidates: Mutex::new(Vec::new()),
            offers: Mutex::new(Vec::new()),
            source_uris: Mutex::new(Vec::new()),
            ice_senders: Mutex::new(HashMap::new()),
        }
    }

    /// Return `answer` from `process_offer`.
    #[must_use]
    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answer = answer.into();
        self
    }

    /// Fail `operation` with an RPC error.
    #[must_use]
    pub fn failing_at(self, operation: EngineOperation) -> Self {
        let err = EngineError::Rpc {
            code: -32000,
            message: format!("mock failure in {}", operation.as_str()),
        };
        self.failing_with(operation, err)
    }

    /// Fail `operation` with a specific error.
    #[must_use]
    pub fn failing_with(mut self, operation: EngineOperation, err: EngineError) -> Self {
        self.failing = Some((operation, err));
        self
    }

    /// Stall `operation` for `delay` before completing.
    #[must_use]
    pub fn with_delay(mut self, operation: EngineOperation, delay: Duration) -> Self {
        self.delays.insert(operation, delay);
        self
    }

    /// Emit these candidates on every `gather_candidates` call.
    #[must_use]
    pub fn with_gathered_candidates(mut self, candidates: Vec<IceCandidate>) -> Self {
        self.gathered_candidates = candidates;
        self
    }

    /// Make `ensure_connected` fail as if the engine were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Simulate losing the engine connection. Existing candidate streams end
    /// and objects created so far can no longer be addressed.
    pub fn disconnect(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        lock(&self.ice_senders).clear();
    }

    /// Push an engine-side candidate to the subscriber of `endpoint`.
    pub fn push_ice_candidate(&self, endpoint: &EngineObject, candidate: IceCandidate) -> bool {
        lock(&self.ice_senders)
            .get(&endpoint.id)
            .is_some_and(|tx| tx.send(candidate).is_ok())
    }

    /// Number of calls made to `operation`.
    #[must_use]
    pub fn call_count(&self, operation: EngineOperation) -> usize {
        lock(&self.calls).get(&operation).copied().unwrap_or(0)
    }

    /// Number of successful releases.
    #[must_use]
    pub fn release_count(&self) -> usize {
        lock(&self.released).len()
    }

    #[must_use]
    pub fn released(&self) -> Vec<EngineObject> {
        lock(&self.released).clone()
    }

    /// Remote candidates forwarded by clients.
    #[must_use]
    pub fn remote_candidates(&self) -> Vec<IceCandidate> {
        lock(&self.remote_candidates).clone()
    }

    #[must_use]
    pub fn offers(&self) -> Vec<String> {
        lock(&self.offers).clone()
    }

    #[must_use]
    pub fn source_uris(&self) -> Vec<String> {
        lock(&self.source_uris).clone()
    }

    async fn enter(&self, operation: EngineOperation) -> Result<(), EngineError> {
        *lock(&self.calls).entry(operation).or_insert(0) += 1;
        if let Some(delay) = self.delays.get(&operation) {
            tokio::time::sleep(*delay).await;
        }
        match &self.failing {
            Some((op, err)) if *op == operation => Err(err.clone()),
            _ => Ok(()),
        }
    }

    fn check_epoch(&self, object: &EngineObject) -> Result<(), EngineError> {
        if object.epoch == self.epoch.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::NotConnected)
        }
    }

    fn new_object(&self, kind: &str) -> EngineObject {
        let n = self.next_object.fetch_add(1, Ordering::SeqCst) + 1;
        EngineObject::new(format!("{kind}-{n}"), self.epoch.load(Ordering::SeqCst))
    }
}

/// Lock a std mutex, recovering from poisoning.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[async_trait]
impl MediaEngine for MockMediaEngine {
    async fn ensure_connected(&self) -> Result<(), EngineError> {
        self.enter(EngineOperation::Connect).await?;
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(EngineError::Unreachable {
                endpoint: "mock://engine".to_string(),
                reason: "engine is down".to_string(),
            });
        }
        Ok(())
    }

    async fn create_pipeline(&self) -> Result<EngineObject, EngineError> {
        self.enter(EngineOperation::CreatePipeline).await?;
        Ok(self.new_object("pipeline"))
    }

    async fn create_source_endpoint(
        &self,
        pipeline: &EngineObject,
        uri: &str,
    ) -> Result<EngineObject, EngineError> {
        self.check_epoch(pipeline)?;
        self.enter(EngineOperation::CreateSourceEndpoint).await?;
        lock(&self.source_uris).push(uri.to_string());
        Ok(self.new_object("player"))
    }

    async fn create_sink_endpoint(
        &self,
        pipeline: &EngineObject,
    ) -> Result<EngineObject, EngineError> {
        self.check_epoch(pipeline)?;
        self.enter(EngineOperation::CreateSinkEndpoint).await?;
        Ok(self.new_object("webrtc"))
    }

    async fn subscribe_ice_candidates(
        &self,
        endpoint: &EngineObject,
    ) -> Result<mpsc::UnboundedReceiver<IceCandidate>, EngineError> {
        self.check_epoch(endpoint)?;
        self.enter(EngineOperation::SubscribeIceCandidates).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.ice_senders).insert(endpoint.id.clone(), tx);
        Ok(rx)
    }

    async fn connect(&self, source: &EngineObject, sink: &EngineObject) -> Result<(), EngineError> {
        self.check_epoch(source)?;
        self.check_epoch(sink)?;
        self.enter(EngineOperation::ConnectEndpoints).await
    }

    async fn process_offer(
        &self,
        endpoint: &EngineObject,
        offer: &str,
    ) -> Result<String, EngineError> {
        self.check_epoch(endpoint)?;
        self.enter(EngineOperation::ProcessOffer).await?;
        lock(&self.offers).push(offer.to_string());
        Ok(self.answer.clone())
    }

    async fn gather_candidates(&self, endpoint: &EngineObject) -> Result<(), EngineError> {
        self.check_epoch(endpoint)?;
        self.enter(EngineOperation::GatherCandidates).await?;
        for candidate in &self.gathered_candidates {
            self.push_ice_candidate(endpoint, candidate.clone());
        }
        Ok(())
    }

    async fn play(&self, source: &EngineObject) -> Result<(), EngineError> {
        self.check_epoch(source)?;
        self.enter(EngineOperation::Play).await
    }

    async fn add_ice_candidate(
        &self,
        endpoint: &EngineObject,
        candidate: &IceCandidate,
    ) -> Result<(), EngineError> {
        self.check_epoch(endpoint)?;
        self.enter(EngineOperation::AddIceCandidate).await?;
        lock(&self.remote_candidates).push(candidate.clone());
        Ok(())
    }

    async fn release(&self, object: &EngineObject) -> Result<(), EngineError> {
        self.enter(EngineOperation::Release).await?;
        self.check_epoch(object)?;
        lock(&self.released).push(object.clone());
        lock(&self.ice_senders).retain(|_, tx| !tx.is_closed());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mid: Some("0".to_string()),
            sdp_m_line_index: Some(0),
        }
    }

    #[tokio::test]
    async fn test_mock_records_calls() {
        let mock = MockMediaEngine::new().with_answer("answer-A");

        mock.ensure_connected().await.unwrap();
        let pipeline = mock.create_pipeline().await.unwrap();
        let sink = mock.create_sink_endpoint(&pipeline).await.unwrap();
        let answer = mock.process_offer(&sink, "offer-O").await.unwrap();
        mock.release(&pipeline).await.unwrap();

        assert_eq!(answer, "answer-A");
        assert_eq!(mock.offers(), vec!["offer-O".to_string()]);
        assert_eq!(mock.call_count(EngineOperation::CreatePipeline), 1);
        assert_eq!(mock.release_count(), 1);
        assert_eq!(mock.released(), vec![pipeline]);
    }

    #[tokio::test]
    async fn test_mock_scripted_failure() {
        let mock = MockMediaEngine::new().failing_at(EngineOperation::CreatePipeline);
        let err = mock.create_pipeline().await.unwrap_err();
        assert!(matches!(err, EngineError::Rpc { .. }));
    }

    #[tokio::test]
    async fn test_mock_gathered_candidates_reach_subscriber() {
        let mock = MockMediaEngine::new().with_gathered_candidates(vec![candidate(1), candidate(2)]);
        let pipeline = mock.create_pipeline().await.unwrap();
        let sink = mock.create_sink_endpoint(&pipeline).await.unwrap();
        let mut rx = mock.subscribe_ice_candidates(&sink).await.unwrap();

        mock.gather_candidates(&sink).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), candidate(1));
        assert_eq!(rx.recv().await.unwrap(), candidate(2));
    }

    #[tokio::test]
    async fn test_mock_disconnect_ends_streams_and_invalidates_objects() {
        let mock = MockMediaEngine::new();
        let pipeline = mock.create_pipeline().await.unwrap();
        let sink = mock.create_sink_endpoint(&pipeline).await.unwrap();
        let mut rx = mock.subscribe_ice_candidates(&sink).await.unwrap();

        mock.disconnect();

        assert!(rx.recv().await.is_none());
        assert_eq!(
            mock.release(&pipeline).await.unwrap_err(),
            EngineError::NotConnected
        );
        assert_eq!(mock.release_count(), 0);
        assert!(mock.create_pipeline().await.is_ok());
    }

    #[tokio::test]
    async fn test_mock_unreachable() {
        let mock = MockMediaEngine::new();
        mock.set_unreachable(true);
        assert!(matches!(
            mock.ensure_connected().await,
            Err(EngineError::Unreachable { .. })
        ));
    }
}
