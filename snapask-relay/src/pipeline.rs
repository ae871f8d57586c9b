use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use serde::Serialize;
use snapask_core::{CommandKind, ResultMessage, Seq};
use thiserror::Error;
use tokio::{
    sync::{Mutex, broadcast, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};

use crate::{
    analyzer::{AnalysisFault, VisionAnalyzer},
    broadcast::ResultBroadcaster,
    capture::{CaptureArtifact, CaptureFault, ScreenCapturer},
    router::Command,
};

pub const DEFAULT_ANALYSIS_TIMEOUT: Duration = Duration::from_secs(30);
const STAGE_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStage {
    Pending,
    Capturing,
    Analyzing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageEvent {
    pub seq: Seq,
    pub stage: PipelineStage,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineFault {
    #[error(transparent)]
    Capture(#[from] CaptureFault),
    #[error(transparent)]
    Analysis(#[from] AnalysisFault),
    #[error("timeout")]
    Timeout,
    #[error("no screenshot captured yet")]
    NoArtifact,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineConfig {
    pub analysis_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            analysis_timeout: DEFAULT_ANALYSIS_TIMEOUT,
        }
    }
}

enum Outcome {
    Captured(CaptureArtifact),
    Answered {
        answer: String,
        artifact: CaptureArtifact,
    },
}

/// Executes commands: capture, then optionally analyze, then hand the result to the broadcaster.
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    // The capture gate. Whoever holds it owns the display until its command finishes.
    gate: Mutex<Arc<dyn ScreenCapturer>>,
    analyzer: Arc<dyn VisionAnalyzer>,
    latest: watch::Sender<Option<CaptureArtifact>>,
    stages: broadcast::Sender<StageEvent>,
    broadcaster: ResultBroadcaster,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        capturer: Arc<dyn ScreenCapturer>,
        analyzer: Arc<dyn VisionAnalyzer>,
        broadcaster: ResultBroadcaster,
        config: PipelineConfig,
    ) -> Self {
        let (latest, _) = watch::channel(None);
        let (stages, _) = broadcast::channel(STAGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(PipelineInner {
                gate: Mutex::new(capturer),
                analyzer,
                latest,
                stages,
                broadcaster,
                config,
            }),
        }
    }

    pub fn subscribe_stages(&self) -> broadcast::Receiver<StageEvent> {
        self.inner.stages.subscribe()
    }

    pub fn latest_artifact(&self) -> Option<CaptureArtifact> {
        self.inner.latest.borrow().clone()
    }

    /// Drains the router queue in sequence order.
    ///
    /// Capturing commands run one at a time on a dedicated worker; `query` commands reuse the
    /// latest artifact and run concurrently so a slow analysis never holds them up.
    pub fn spawn(&self, queue: mpsc::UnboundedReceiver<Command>) -> JoinHandle<()> {
        let pipeline = self.clone();
        tokio::spawn(pipeline.dispatch(queue))
    }

    async fn dispatch(self, mut queue: mpsc::UnboundedReceiver<Command>) {
        let (capture_tx, capture_rx) = mpsc::unbounded_channel::<Command>();
        let worker = tokio::spawn(self.clone().capture_worker(capture_rx));

        while let Some(command) = queue.recv().await {
            self.publish(command.seq, PipelineStage::Pending);
            if command.kind.captures() {
                if capture_tx.send(command).is_err() {
                    warn!("capture worker stopped; dispatcher exiting");
                    break;
                }
            } else {
                let pipeline = self.clone();
                tokio::spawn(async move { pipeline.run_query(command).await });
            }
        }

        drop(capture_tx);
        let _ = worker.await;
        debug!("pipeline dispatcher stopped");
    }

    async fn capture_worker(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        while let Some(command) = commands.recv().await {
            self.run_capture(command).await;
        }
    }

    async fn run_capture(&self, command: Command) {
        let capturer = self.inner.gate.lock().await;
        self.publish(command.seq, PipelineStage::Capturing);

        let outcome = self.capture_then_analyze(&capturer, &command).await;
        let result = self.finish(&command, outcome);
        self.inner.broadcaster.deliver(result, command.origin).await;
        // Gate released here, after delivery, so results of captures leave in seq order.
        drop(capturer);
    }

    async fn capture_then_analyze(
        &self,
        capturer: &Arc<dyn ScreenCapturer>,
        command: &Command,
    ) -> Result<Outcome, PipelineFault> {
        let capturer = Arc::clone(capturer);
        let device_id = capturer.device_id().to_owned();
        let png = tokio::task::spawn_blocking(move || capturer.capture_png())
            .await
            .map_err(|e| CaptureFault(format!("capture task failed: {e}")))??;

        let artifact = CaptureArtifact::new(Bytes::from(png), device_id);
        self.inner.latest.send_replace(Some(artifact.clone()));
        debug!(seq = command.seq, bytes = artifact.png.len(), "screenshot stored");

        match (command.kind, command.question.as_deref()) {
            (CommandKind::CaptureQuery, Some(question)) => {
                let answer = self.analyze(command.seq, &artifact, question).await?;
                Ok(Outcome::Answered { answer, artifact })
            }
            _ => Ok(Outcome::Captured(artifact)),
        }
    }

    async fn run_query(&self, command: Command) {
        let outcome: Result<Outcome, PipelineFault> = async {
            let artifact = self.latest_artifact().ok_or(PipelineFault::NoArtifact)?;
            let question = command.question.as_deref().unwrap_or_default();
            let answer = self.analyze(command.seq, &artifact, question).await?;
            Ok(Outcome::Answered { answer, artifact })
        }
        .await;

        let result = self.finish(&command, outcome);
        self.inner.broadcaster.deliver(result, command.origin).await;
    }

    async fn analyze(
        &self,
        seq: Seq,
        artifact: &CaptureArtifact,
        question: &str,
    ) -> Result<String, PipelineFault> {
        self.publish(seq, PipelineStage::Analyzing);
        let analysis = self.inner.analyzer.analyze(&artifact.png, question);
        match tokio::time::timeout(self.inner.config.analysis_timeout, analysis).await {
            Ok(Ok(answer)) => Ok(answer),
            Ok(Err(fault)) => Err(fault.into()),
            Err(_) => {
                warn!(seq, timeout = ?self.inner.config.analysis_timeout, "analysis timed out");
                Err(PipelineFault::Timeout)
            }
        }
    }

    fn finish(&self, command: &Command, outcome: Result<Outcome, PipelineFault>) -> ResultMessage {
        match outcome {
            Ok(Outcome::Captured(artifact)) => {
                self.publish(command.seq, PipelineStage::Completed);
                ResultMessage::captured(command.seq, artifact.info(true))
            }
            Ok(Outcome::Answered { answer, artifact }) => {
                self.publish(command.seq, PipelineStage::Completed);
                let info = artifact.info(command.kind.captures());
                ResultMessage::answered(command.seq, answer, Some(info))
            }
            Err(fault) => {
                warn!(seq = command.seq, kind = %command.kind, "command failed: {}", fault);
                self.publish(command.seq, PipelineStage::Failed);
                ResultMessage::failed(command.seq, fault.to_string())
            }
        }
    }

    fn publish(&self, seq: Seq, stage: PipelineStage) {
        info!(seq, stage = ?stage, "pipeline stage");
        let _ = self.inner.stages.send(StageEvent { seq, stage });
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex as StdMutex,
        atomic::{AtomicUsize, Ordering},
    };

    use futures::future::BoxFuture;
    use snapask_core::{Role, ServerMessage};

    use super::*;
    use crate::{registry::ConnectionRegistry, router::CommandRouter};

    #[derive(Default)]
    struct FakeCapturer {
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        calls: AtomicUsize,
        failures_left: AtomicUsize,
        delay: Duration,
    }

    impl ScreenCapturer for FakeCapturer {
        fn capture_png(&self) -> Result<Vec<u8>, CaptureFault> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::thread::sleep(self.delay);
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            let failed = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                return Err(CaptureFault("display unavailable".to_owned()));
            }
            Ok(vec![call as u8])
        }

        fn device_id(&self) -> &str {
            "test-display"
        }
    }

    struct FakeAnalyzer {
        delay: Duration,
        hang_first: StdMutex<bool>,
        fail: bool,
    }

    impl FakeAnalyzer {
        fn answering() -> Self {
            Self {
                delay: Duration::ZERO,
                hang_first: StdMutex::new(false),
                fail: false,
            }
        }
    }

    impl VisionAnalyzer for FakeAnalyzer {
        fn analyze<'a>(
            &'a self,
            image_png: &'a [u8],
            question: &'a str,
        ) -> BoxFuture<'a, Result<String, AnalysisFault>> {
            Box::pin(async move {
                let hang = std::mem::replace(&mut *self.hang_first.lock().unwrap(), false);
                if hang {
                    std::future::pending::<()>().await;
                }
                tokio::time::sleep(self.delay).await;
                if self.fail {
                    return Err(AnalysisFault("model unavailable".to_owned()));
                }
                Ok(format!("{question} -> image {}", image_png[0]))
            })
        }
    }

    struct Harness {
        router: CommandRouter,
        pipeline: Pipeline,
        controller: u64,
        controller_rx: mpsc::UnboundedReceiver<ServerMessage>,
        overlay: u64,
        overlay_rx: mpsc::UnboundedReceiver<ServerMessage>,
    }

    async fn harness(
        capturer: Arc<FakeCapturer>,
        analyzer: FakeAnalyzer,
        analysis_timeout: Duration,
    ) -> Harness {
        let registry = ConnectionRegistry::new();
        let broadcaster = ResultBroadcaster::new(registry.clone());
        let pipeline = Pipeline::new(
            capturer,
            Arc::new(analyzer),
            broadcaster,
            PipelineConfig { analysis_timeout },
        );
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let router = CommandRouter::new(registry.clone(), queue_tx);
        pipeline.spawn(queue_rx);

        let (tx_c, controller_rx) = mpsc::unbounded_channel();
        let (tx_o, overlay_rx) = mpsc::unbounded_channel();
        let controller = registry
            .register(1, Role::Controller, None, tx_c)
            .await
            .unwrap();
        let overlay = registry.register(2, Role::Overlay, None, tx_o).await.unwrap();

        Harness {
            router,
            pipeline,
            controller,
            controller_rx,
            overlay,
            overlay_rx,
        }
    }

    async fn next_result(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> ResultMessage {
        let message = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("result within timeout")
            .expect("channel open");
        match message {
            ServerMessage::Result(result) => result,
            other => panic!("unexpected message {other:?}"),
        }
    }

    async fn collect_stages(
        rx: &mut broadcast::Receiver<StageEvent>,
        until_terminal: usize,
    ) -> Vec<StageEvent> {
        let mut events = Vec::new();
        let mut terminal = 0;
        while terminal < until_terminal {
            let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("stage within timeout")
                .expect("stage channel open");
            if matches!(
                event.stage,
                PipelineStage::Completed | PipelineStage::Failed
            ) {
                terminal += 1;
            }
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn capture_and_query_walks_every_stage() {
        let capturer = Arc::new(FakeCapturer::default());
        let mut h = harness(capturer, FakeAnalyzer::answering(), DEFAULT_ANALYSIS_TIMEOUT).await;
        let mut stages = h.pipeline.subscribe_stages();

        h.router
            .submit(
                r#"{"kind":"capture+query","question":"What is on screen?"}"#,
                h.controller,
            )
            .await
            .unwrap();

        let events = collect_stages(&mut stages, 1).await;
        let observed = events.iter().map(|e| e.stage).collect::<Vec<_>>();
        assert_eq!(
            observed,
            vec![
                PipelineStage::Pending,
                PipelineStage::Capturing,
                PipelineStage::Analyzing,
                PipelineStage::Completed
            ]
        );

        let to_controller = next_result(&mut h.controller_rx).await;
        assert_eq!(to_controller.seq, Some(1));
        assert!(to_controller.success);
        assert_eq!(
            to_controller.answer.as_deref(),
            Some("What is on screen? -> image 1")
        );
        let to_overlay = next_result(&mut h.overlay_rx).await;
        assert_eq!(to_overlay.answer, to_controller.answer);
    }

    #[tokio::test]
    async fn concurrent_captures_hold_the_gate_one_at_a_time() {
        let capturer = Arc::new(FakeCapturer {
            delay: Duration::from_millis(20),
            ..FakeCapturer::default()
        });
        let mut h = harness(
            Arc::clone(&capturer),
            FakeAnalyzer::answering(),
            DEFAULT_ANALYSIS_TIMEOUT,
        )
        .await;
        let mut stages = h.pipeline.subscribe_stages();

        let mut submits = Vec::new();
        for _ in 0..5 {
            let router = h.router.clone();
            let controller = h.controller;
            submits.push(tokio::spawn(async move {
                router.submit(r#"{"kind":"capture"}"#, controller).await
            }));
        }
        for submit in submits {
            submit.await.unwrap().unwrap();
        }

        let events = collect_stages(&mut stages, 5).await;
        assert_eq!(capturer.max_in_flight.load(Ordering::SeqCst), 1);

        // A capture only starts once the previous one has finished, in seq order.
        let execution = events
            .iter()
            .filter(|e| e.stage != PipelineStage::Pending)
            .map(|e| (e.seq, e.stage))
            .collect::<Vec<_>>();
        let expected = (1..=5)
            .flat_map(|seq| {
                [
                    (seq, PipelineStage::Capturing),
                    (seq, PipelineStage::Completed),
                ]
            })
            .collect::<Vec<_>>();
        assert_eq!(execution, expected);

        for seq in 1..=5 {
            assert_eq!(next_result(&mut h.controller_rx).await.seq, Some(seq));
        }
    }

    #[tokio::test]
    async fn timeout_fails_command_and_releases_gate() {
        let capturer = Arc::new(FakeCapturer::default());
        let analyzer = FakeAnalyzer {
            hang_first: StdMutex::new(true),
            ..FakeAnalyzer::answering()
        };
        let mut h = harness(capturer, analyzer, Duration::from_millis(100)).await;

        h.router
            .submit(r#"{"kind":"capture+query","question":"slow"}"#, h.controller)
            .await
            .unwrap();
        h.router
            .submit(r#"{"kind":"capture"}"#, h.controller)
            .await
            .unwrap();

        let failed = next_result(&mut h.controller_rx).await;
        assert_eq!(failed.seq, Some(1));
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("timeout"));
        let overlay_failed = next_result(&mut h.overlay_rx).await;
        assert_eq!(overlay_failed.error.as_deref(), Some("timeout"));

        let next = next_result(&mut h.controller_rx).await;
        assert_eq!(next.seq, Some(2));
        assert!(next.success);
        assert!(next.artifact.is_some());
    }

    #[tokio::test]
    async fn repeated_capture_faults_never_deadlock() {
        let capturer = Arc::new(FakeCapturer {
            failures_left: AtomicUsize::new(3),
            ..FakeCapturer::default()
        });
        let mut h = harness(capturer, FakeAnalyzer::answering(), DEFAULT_ANALYSIS_TIMEOUT).await;

        for _ in 0..4 {
            h.router
                .submit(r#"{"kind":"capture"}"#, h.controller)
                .await
                .unwrap();
        }

        for seq in 1..=3 {
            let result = next_result(&mut h.controller_rx).await;
            assert_eq!(result.seq, Some(seq));
            assert_eq!(
                result.error.as_deref(),
                Some("screen capture failed: display unavailable")
            );
        }
        let ok = next_result(&mut h.controller_rx).await;
        assert_eq!(ok.seq, Some(4));
        assert!(ok.success);
    }

    #[tokio::test]
    async fn query_reuses_latest_artifact_without_capturing() {
        let capturer = Arc::new(FakeCapturer::default());
        let mut h = harness(
            Arc::clone(&capturer),
            FakeAnalyzer::answering(),
            DEFAULT_ANALYSIS_TIMEOUT,
        )
        .await;

        h.router
            .submit(r#"{"kind":"query","question":"early"}"#, h.overlay)
            .await
            .unwrap();
        let early = next_result(&mut h.overlay_rx).await;
        assert_eq!(early.error.as_deref(), Some("no screenshot captured yet"));

        h.router
            .submit(r#"{"kind":"capture"}"#, h.controller)
            .await
            .unwrap();
        next_result(&mut h.controller_rx).await;
        next_result(&mut h.overlay_rx).await;

        h.router
            .submit(r#"{"kind":"query","question":"again"}"#, h.overlay)
            .await
            .unwrap();
        let answered = next_result(&mut h.overlay_rx).await;
        assert_eq!(answered.seq, Some(3));
        assert_eq!(answered.answer.as_deref(), Some("again -> image 1"));
        assert_eq!(capturer.calls.load(Ordering::SeqCst), 1);
        assert!(h.pipeline.latest_artifact().is_some());
    }

    #[tokio::test]
    async fn analysis_fault_is_reported_to_all_recipients() {
        let capturer = Arc::new(FakeCapturer::default());
        let analyzer = FakeAnalyzer {
            fail: true,
            ..FakeAnalyzer::answering()
        };
        let mut h = harness(capturer, analyzer, DEFAULT_ANALYSIS_TIMEOUT).await;

        h.router
            .submit(r#"{"kind":"capture+query","question":"x"}"#, h.controller)
            .await
            .unwrap();
        for rx in [&mut h.controller_rx, &mut h.overlay_rx] {
            let result = next_result(rx).await;
            assert!(!result.success);
            assert_eq!(
                result.error.as_deref(),
                Some("analysis failed: model unavailable")
            );
        }
    }
}
