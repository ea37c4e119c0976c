use crate::error::GenerationError;
use crate::generator::TextGenerator;
use crate::pipeline::{Completion, FetchRequest, FetchTicket, RetrievalPipeline};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

type FetchResult = (FetchTicket, Result<String, GenerationError>);

pub struct Dispatcher {
    generator: Arc<dyn TextGenerator>,
    result_tx: Sender<FetchResult>,
    result_rx: Receiver<FetchResult>,
    pending: usize,
}

impl Dispatcher {
    pub fn new(generator: Arc<dyn TextGenerator>) -> Self {
        let (result_tx, result_rx) = channel();
        Self {
            generator,
            result_tx,
            result_rx,
            pending: 0,
        }
    }

    /// Number of submitted requests whose results have not been applied.
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn submit(&mut self, request: FetchRequest) {
        let generator = Arc::clone(&self.generator);
        let tx = self.result_tx.clone();
        let FetchRequest {
            ticket,
            key,
            scope,
            turns,
        } = request;
        self.pending += 1;

        let spawned = thread::Builder::new()
            .name(format!("leafscope-fetch-{key}"))
            .spawn(move || {
                let result = generator.generate(&turns);
                if tx.send((ticket, result)).is_err() {
                    log::debug!("dispatcher dropped before {scope:?} fetch for {key} finished");
                }
            });

        if let Err(err) = spawned {
            log::error!("failed to spawn fetch worker: {err}");
            let failure = Err(GenerationError::Io(err.to_string()));
            // Own sender, so the receiver is alive.
            let _ = self.result_tx.send((ticket, failure));
        }
    }

    /// Apply one result, then start any full fetch it was holding back.
    fn apply(
        &mut self,
        pipeline: &mut RetrievalPipeline,
        ticket: FetchTicket,
        result: Result<String, GenerationError>,
    ) -> Completion {
        self.pending = self.pending.saturating_sub(1);
        let completion = pipeline.complete(ticket, result);
        if let Some(request) = pipeline.take_deferred() {
            self.submit(request);
        }
        completion
    }

    /// Apply every result that has already arrived. Never blocks.
    pub fn poll(&mut self, pipeline: &mut RetrievalPipeline) -> Vec<Completion> {
        let mut applied = Vec::new();
        loop {
            match self.result_rx.try_recv() {
                Ok((ticket, result)) => applied.push(self.apply(pipeline, ticket, result)),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    log::warn!("fetch result channel disconnected");
                    break;
                }
            }
        }
        applied
    }

    /// Block until nothing is pending or `timeout` elapses, applying results
    /// as they arrive.
    pub fn wait(&mut self, pipeline: &mut RetrievalPipeline, timeout: Duration) -> Vec<Completion> {
        let deadline = Instant::now() + timeout;
        let mut applied = Vec::new();
        while self.pending > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                log::warn!("gave up waiting on {} fetch(es)", self.pending);
                break;
            }
            match self.result_rx.recv_timeout(remaining) {
                Ok((ticket, result)) => applied.push(self.apply(pipeline, ticket, result)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        applied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ContentCache;
    use crate::content::Section;
    use crate::generator::Turn;
    use crate::pipeline::{RetryOutcome, SectionState};

    const FULL: &str = "### General Information\nG\n### Symptoms\nS\n### Treatment\nT\n### Prevention\nP";

    /// Answers full prompts with `FULL`, single-section prompts with a fixed
    /// line, after an optional delay.
    struct Canned {
        delay: Duration,
    }

    impl TextGenerator for Canned {
        fn generate(&self, turns: &[Turn]) -> Result<String, GenerationError> {
            thread::sleep(self.delay);
            let last = turns.last().map(|t| t.content.as_str()).unwrap_or_default();
            if last.contains("###") {
                Ok(FULL.to_string())
            } else {
                Ok("Retried text.".to_string())
            }
        }
    }

    fn setup(delay_ms: u64) -> (Dispatcher, RetrievalPipeline) {
        let dispatcher = Dispatcher::new(Arc::new(Canned {
            delay: Duration::from_millis(delay_ms),
        }));
        (dispatcher, RetrievalPipeline::new(Arc::new(ContentCache::new())))
    }

    #[test]
    fn wait_applies_background_results() {
        let (mut dispatcher, mut pipeline) = setup(0);
        let request = pipeline.select("Brown_Spot").unwrap();
        dispatcher.submit(request);
        assert_eq!(dispatcher.pending(), 1);

        let applied = dispatcher.wait(&mut pipeline, Duration::from_secs(5));
        assert_eq!(applied.len(), 1);
        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(pipeline.states().unwrap().general, SectionState::Ready("G".into()));
    }

    #[test]
    fn poll_does_not_block() {
        let (mut dispatcher, mut pipeline) = setup(200);
        dispatcher.submit(pipeline.select("Tungro").unwrap());
        assert!(dispatcher.poll(&mut pipeline).is_empty());
        assert!(pipeline.states().unwrap().general.is_loading());
        dispatcher.wait(&mut pipeline, Duration::from_secs(5));
        assert!(!pipeline.states().unwrap().general.is_loading());
    }

    #[test]
    fn switching_keys_mid_flight_keeps_new_view() {
        let (mut dispatcher, mut pipeline) = setup(20);
        dispatcher.submit(pipeline.select("A").unwrap());
        dispatcher.submit(pipeline.select("B").unwrap());
        let applied = dispatcher.wait(&mut pipeline, Duration::from_secs(5));
        assert_eq!(applied.len(), 2);
        assert_eq!(pipeline.active_key(), Some("B"));
        assert!(pipeline.cache().contains("A"));
        assert!(pipeline.cache().contains("B"));
    }

    #[test]
    fn reload_behind_a_retry_is_submitted_when_it_lands() {
        let (mut dispatcher, mut pipeline) = setup(20);
        dispatcher.submit(pipeline.select("A").unwrap());
        dispatcher.wait(&mut pipeline, Duration::from_secs(5));

        let RetryOutcome::Dispatched(request) = pipeline.retry("A", Section::Treatment) else {
            panic!("expected a dispatched retry");
        };
        dispatcher.submit(request);
        assert!(pipeline.reload().is_none());
        assert_eq!(dispatcher.pending(), 1);

        let applied = dispatcher.wait(&mut pipeline, Duration::from_secs(5));
        assert_eq!(applied.len(), 2);
        assert_eq!(dispatcher.pending(), 0);
        assert_eq!(pipeline.states().unwrap().treatment, SectionState::Ready("T".into()));
        assert_eq!(pipeline.cache().get("A").unwrap().treatment, "T");
    }

    #[test]
    fn retry_runs_in_background() {
        let (mut dispatcher, mut pipeline) = setup(0);
        dispatcher.submit(pipeline.select("A").unwrap());
        dispatcher.wait(&mut pipeline, Duration::from_secs(5));

        let RetryOutcome::Dispatched(request) = pipeline.retry("A", Section::Symptoms) else {
            panic!("expected a dispatched retry");
        };
        dispatcher.submit(request);
        dispatcher.wait(&mut pipeline, Duration::from_secs(5));
        assert_eq!(
            pipeline.states().unwrap().symptoms,
            SectionState::Ready("Retried text.".into())
        );
        assert_eq!(pipeline.cache().get("A").unwrap().symptoms, "Retried text.");
    }
}
