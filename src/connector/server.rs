use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::{cancelled, ConnectorEvent, ConnectorId, ConnectorState, EventSender};
use crate::descriptor::ServiceDescriptor;
use crate::provider::{BoxListener, TransportProvider};

/// Accept loop for one advertised service.
///
/// Keeps accepting until cancelled. Accept failures reopen the endpoint after
/// a short random pause; more than `retry_budget` failures in a row end the
/// connector with a failure report.
#[derive(Debug, Clone)]
pub struct ServerConnector {
    descriptor: ServiceDescriptor,
    retry_budget: u32,
    retry_jitter: Duration,
}

impl ServerConnector {
    /// Serve `descriptor` with the default retry policy.
    pub fn new(descriptor: ServiceDescriptor) -> Self {
        Self {
            descriptor,
            retry_budget: 3,
            retry_jitter: Duration::from_millis(50),
        }
    }

    /// Consecutive failures tolerated before giving up.
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Upper bound of the random pause before reopening the endpoint.
    pub fn with_retry_jitter(mut self, jitter: Duration) -> Self {
        self.retry_jitter = jitter;
        self
    }

    /// Served service.
    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn pause(&self) -> Duration {
        let max = u64::try_from(self.retry_jitter.as_millis()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max))
    }

    pub(super) async fn run(
        self,
        id: ConnectorId,
        transport: Arc<dyn TransportProvider>,
        mut cancel: watch::Receiver<bool>,
        state: watch::Sender<ConnectorState>,
        events: EventSender,
    ) {
        state.send_replace(ConnectorState::Working);
        let service = self.descriptor.identifier();
        let mut endpoint: Option<BoxListener> = None;
        let mut failures = 0u32;

        info!(connector = %id, service = %service, "Serving");

        loop {
            let listening = match endpoint.clone() {
                Some(listening) => listening,
                None => {
                    let opened = tokio::select! {
                        biased;
                        _ = cancelled(&mut cancel) => break,
                        result = transport.listen(&self.descriptor) => result,
                    };
                    match opened {
                        Ok(listening) => {
                            debug!(connector = %id, service = %service, "Endpoint open");
                            endpoint = Some(Arc::clone(&listening));
                            listening
                        }
                        Err(error) => {
                            failures += 1;
                            warn!(
                                connector = %id,
                                service = %service,
                                failures,
                                error = %error,
                                "Opening endpoint failed"
                            );
                            if failures > self.retry_budget {
                                self.give_up(id, &state, &events, error.to_string());
                                return;
                            }
                            if self.backoff(&mut cancel).await {
                                break;
                            }
                            continue;
                        }
                    }
                }
            };

            let accepted = tokio::select! {
                biased;
                _ = cancelled(&mut cancel) => break,
                result = listening.accept() => result,
            };

            match accepted {
                Ok((peer, channel)) => {
                    failures = 0;
                    debug!(connector = %id, service = %service, peer = %peer, "Accepted");
                    let event = ConnectorEvent::Accepted {
                        connector: id,
                        peer,
                        channel,
                    };
                    if let Err(mpsc::error::SendError(ConnectorEvent::Accepted { channel, .. })) =
                        events.send(event)
                    {
                        let _ = channel.close();
                        break;
                    }
                }
                Err(error) => {
                    failures += 1;
                    warn!(
                        connector = %id,
                        service = %service,
                        failures,
                        error = %error,
                        "Accept failed; reopening endpoint"
                    );
                    close_endpoint(&listening);
                    endpoint = None;
                    if failures > self.retry_budget {
                        self.give_up(id, &state, &events, error.to_string());
                        return;
                    }
                    if self.backoff(&mut cancel).await {
                        break;
                    }
                }
            }
        }

        if let Some(listening) = endpoint {
            close_endpoint(&listening);
        }
        info!(connector = %id, service = %service, "Stopped serving");
        state.send_replace(ConnectorState::Cancelled);
        let _ = events.send(ConnectorEvent::Stopped { connector: id });
    }

    /// Sleep a random pause. Returns true if cancelled meanwhile.
    async fn backoff(&self, cancel: &mut watch::Receiver<bool>) -> bool {
        let pause = self.pause();
        tokio::select! {
            biased;
            _ = cancelled(cancel) => true,
            _ = tokio::time::sleep(pause) => false,
        }
    }

    fn give_up(
        &self,
        id: ConnectorId,
        state: &watch::Sender<ConnectorState>,
        events: &EventSender,
        reason: String,
    ) {
        warn!(
            connector = %id,
            service = %self.descriptor.identifier(),
            budget = self.retry_budget,
            "Retry budget exhausted"
        );
        state.send_replace(ConnectorState::Failed);
        let _ = events.send(ConnectorEvent::Failed {
            connector: id,
            reason,
        });
    }
}

fn close_endpoint(listening: &BoxListener) {
    if let Err(error) = listening.close() {
        debug!(error = %error, "Closing endpoint failed");
    }
}
