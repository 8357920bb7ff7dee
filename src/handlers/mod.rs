//! JSON-lines operator console.
//!
//! Each input line is one `Request`; each reply, and each event of a live
//! results subscription, is written back as one JSON line.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{mpsc, watch};

use crate::broadcast::{ResultsEvent, Subscription};
use crate::engine::{AuditReport, Engine, Results};
use crate::error::EngineError;
use crate::ledger::CastOutcome;
use crate::lifecycle::CloseOutcome;
use crate::models::{Ballot, NewPoll, OptionSpec, PollUpdate, PollView};

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Create {
        title: String,
        #[serde(default)]
        description: String,
        options: Vec<OptionSpec>,
        starts_at: DateTime<Utc>,
        ends_at: DateTime<Utc>,
        created_by: String,
    },
    List,
    Active,
    Get {
        poll_id: String,
    },
    Update {
        poll_id: String,
        admin_id: String,
        changes: PollUpdate,
    },
    Delete {
        poll_id: String,
        admin_id: String,
    },
    Close {
        poll_id: String,
        admin_id: String,
    },
    Cast {
        poll_id: String,
        voter_id: String,
        option_id: String,
    },
    Ballot {
        poll_id: String,
        voter_id: String,
    },
    Results {
        poll_id: String,
    },
    Subscribe {
        poll_id: String,
    },
    Audit {
        poll_id: String,
    },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Response {
    Created { poll_id: String },
    Polls { polls: Vec<PollView> },
    Poll { poll: PollView },
    Deleted { poll_id: String },
    Close { outcome: CloseOutcome },
    Cast { outcome: CastOutcome },
    Ballot { ballot: Option<Ballot> },
    Results { results: Results },
    Subscribed { poll_id: String, subscription: u64 },
    Audit { report: AuditReport },
    Event { event: ResultsEvent },
    Error { category: String, message: String },
}

impl From<EngineError> for Response {
    fn from(err: EngineError) -> Self {
        Response::Error {
            category: err.category().to_string(),
            message: err.to_string(),
        }
    }
}

/// Where a console session writes its replies and subscription events.
#[derive(Clone)]
pub struct Outbox {
    tx: mpsc::Sender<Response>,
    shutdown: watch::Receiver<bool>,
}

impl Outbox {
    /// `shutdown` turning true stops every subscription forwarder of the session.
    pub fn new(tx: mpsc::Sender<Response>, shutdown: watch::Receiver<bool>) -> Self {
        Self { tx, shutdown }
    }

    /// Returns false once the session's writer is gone.
    pub async fn send(&self, response: Response) -> bool {
        self.tx.send(response).await.is_ok()
    }

    fn forward(&self, mut subscription: Subscription) {
        let out = self.clone();
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            if *shutdown.borrow_and_update() {
                return;
            }
            loop {
                tokio::select! {
                    event = subscription.recv() => {
                        let Some(event) = event else { break };
                        if !out.send(Response::Event { event }).await {
                            break;
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Stopped forwarding subscription {} of poll {}", subscription.id(), subscription.poll_id());
        });
    }
}

/// Parses and executes one console line. Subscriptions keep forwarding
/// events to `out` until the poll's feed ends, `out` is closed or the
/// session shuts down.
pub async fn handle_line(engine: &Arc<Engine>, line: &str, out: &Outbox) -> Response {
    let request: Request = match serde_json::from_str(line) {
        Ok(request) => request,
        Err(e) => {
            warn!("Malformed console request: {}", e);
            return Response::Error {
                category: "malformed".to_string(),
                message: e.to_string(),
            };
        }
    };

    match handle_request(engine, request, out).await {
        Ok(response) => response,
        Err(e) => {
            info!("Request failed: {}", e);
            e.into()
        }
    }
}

pub async fn handle_request(
    engine: &Arc<Engine>,
    request: Request,
    out: &Outbox,
) -> Result<Response, EngineError> {
    let response = match request {
        Request::Create {
            title,
            description,
            options,
            starts_at,
            ends_at,
            created_by,
        } => {
            let poll_id = engine
                .create_poll(NewPoll {
                    title,
                    description,
                    options,
                    starts_at,
                    ends_at,
                    created_by,
                })
                .await?;
            Response::Created { poll_id }
        }
        Request::List => Response::Polls {
            polls: engine.list_polls().await?,
        },
        Request::Active => Response::Polls {
            polls: engine.list_active_polls().await?,
        },
        Request::Get { poll_id } => Response::Poll {
            poll: engine.get_poll(&poll_id).await?,
        },
        Request::Update {
            poll_id,
            admin_id,
            changes,
        } => Response::Poll {
            poll: engine.update_poll(&poll_id, &admin_id, changes).await?,
        },
        Request::Delete { poll_id, admin_id } => {
            engine.delete_poll(&poll_id, &admin_id).await?;
            Response::Deleted { poll_id }
        }
        Request::Close { poll_id, admin_id } => Response::Close {
            outcome: engine.close_poll_early(&poll_id, &admin_id).await?,
        },
        Request::Cast {
            poll_id,
            voter_id,
            option_id,
        } => Response::Cast {
            outcome: engine.cast_vote(&poll_id, &voter_id, &option_id).await?,
        },
        Request::Ballot { poll_id, voter_id } => Response::Ballot {
            ballot: engine.ballot_of(&poll_id, &voter_id).await?,
        },
        Request::Results { poll_id } => Response::Results {
            results: engine.get_results(&poll_id).await?,
        },
        Request::Subscribe { poll_id } => {
            let subscription = engine.subscribe_results(&poll_id).await?;
            let id = subscription.id();
            out.forward(subscription);
            Response::Subscribed {
                poll_id,
                subscription: id,
            }
        }
        Request::Audit { poll_id } => Response::Audit {
            report: engine.audit(&poll_id).await?,
        },
    };
    Ok(response)
}

/// Serves the console on stdin/stdout until stdin closes.
pub async fn serve_console(engine: Arc<Engine>) {
    serve(engine, tokio::io::stdin(), tokio::io::stdout()).await;
}

/// Serves one console session: requests are read from `input` line by line
/// and replies are written to `output`. Returns once `input` is exhausted,
/// every in-flight request has answered and live subscriptions are stopped.
pub async fn serve<R, W>(engine: Arc<Engine>, input: R, mut output: W)
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::channel::<Response>(1024);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let out = Outbox::new(out_tx, shutdown_rx);

    let writer = tokio::spawn(async move {
        while let Some(response) = out_rx.recv().await {
            let mut line = match serde_json::to_string(&response) {
                Ok(line) => line,
                Err(e) => {
                    error!("Failed to encode response: {}", e);
                    continue;
                }
            };
            line.push('\n');
            if let Err(e) = output.write_all(line.as_bytes()).await {
                error!("Failed to write console output: {}", e);
                break;
            }
            let _ = output.flush().await;
        }
    });

    let mut lines = BufReader::new(input).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                // Handle each request concurrently
                let engine = Arc::clone(&engine);
                let out = out.clone();
                tokio::spawn(async move {
                    let response = handle_line(&engine, &line, &out).await;
                    if !out.send(response).await {
                        warn!("Console output closed before reply could be written");
                    }
                });
            }
            Ok(None) => {
                info!("Console input closed");
                break;
            }
            Err(e) => {
                error!("Failed to read console input: {}", e);
                break;
            }
        }
    }

    // Forwarders hold senders too; stop them so the writer can drain and exit.
    shutdown_tx.send_replace(true);
    drop(out);
    if let Err(e) = writer.await {
        error!("Console writer failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::Database;
    use crate::engine::EngineSettings;
    use crate::lifecycle::Admins;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()
    }

    async fn engine() -> Arc<Engine> {
        let db = Database::in_memory().await.unwrap();
        let clock = ManualClock::new(t0() + Duration::seconds(10));
        Arc::new(Engine::new(
            Arc::new(db),
            Arc::new(clock),
            Admins::new(["root"]),
            EngineSettings::default(),
        ))
    }

    fn outbox() -> (Outbox, mpsc::Receiver<Response>, watch::Sender<bool>) {
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        (Outbox::new(tx, shutdown_rx), rx, shutdown_tx)
    }

    async fn create(engine: &Engine) -> String {
        engine
            .create_poll(NewPoll {
                title: "P".to_string(),
                description: String::new(),
                options: vec!["A".into()],
                starts_at: t0(),
                ends_at: t0() + Duration::seconds(3600),
                created_by: "root".to_string(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_then_cast_over_the_wire() {
        let engine = engine().await;
        let (out, _rx, _shutdown) = outbox();

        let create = format!(
            r#"{{"op":"create","title":"P","options":["A","B"],"starts_at":"{}","ends_at":"{}","created_by":"root"}}"#,
            t0().to_rfc3339(),
            (t0() + Duration::seconds(3600)).to_rfc3339()
        );
        let poll_id = match handle_line(&engine, &create, &out).await {
            Response::Created { poll_id } => poll_id,
            other => panic!("unexpected {:?}", other),
        };

        let option_id = engine.get_poll(&poll_id).await.unwrap().poll.options[0].id.clone();
        let cast = format!(
            r#"{{"op":"cast","poll_id":"{}","voter_id":"v1","option_id":"{}"}}"#,
            poll_id, option_id
        );
        let reply = serde_json::to_value(handle_line(&engine, &cast, &out).await).unwrap();
        assert_eq!(reply["kind"], "cast");
        assert_eq!(reply["outcome"]["result"], "accepted");

        let again = serde_json::to_value(handle_line(&engine, &cast, &out).await).unwrap();
        assert_eq!(again["outcome"]["result"], "rejected");
        assert_eq!(again["outcome"]["reason"], "duplicate_vote");
    }

    #[tokio::test]
    async fn errors_are_reported_by_category() {
        let engine = engine().await;
        let (out, _rx, _shutdown) = outbox();

        let missing = handle_line(&engine, r#"{"op":"results","poll_id":"nope"}"#, &out).await;
        assert!(matches!(missing, Response::Error { ref category, .. } if category == "not_found"));

        let garbage = handle_line(&engine, "not json", &out).await;
        assert!(matches!(garbage, Response::Error { ref category, .. } if category == "malformed"));
    }

    #[tokio::test]
    async fn subscribe_forwards_events() {
        let engine = engine().await;
        let (out, mut rx, _shutdown) = outbox();
        let poll_id = create(&engine).await;

        let request = format!(r#"{{"op":"subscribe","poll_id":"{}"}}"#, poll_id);
        assert!(matches!(
            handle_line(&engine, &request, &out).await,
            Response::Subscribed { .. }
        ));

        match rx.recv().await {
            Some(Response::Event {
                event: ResultsEvent::Snapshot { counts, .. },
            }) => assert_eq!(counts.values().sum::<u64>(), 0),
            other => panic!("expected snapshot event, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn session_ends_at_eof_while_a_subscription_is_live() {
        let engine = engine().await;
        let poll_id = create(&engine).await;

        let (mut input, server_input) = tokio::io::duplex(4096);
        let (server_output, output) = tokio::io::duplex(64 * 1024);
        let session = tokio::spawn(serve(Arc::clone(&engine), server_input, server_output));

        let request = format!("{{\"op\":\"subscribe\",\"poll_id\":\"{}\"}}\n", poll_id);
        input.write_all(request.as_bytes()).await.unwrap();

        let mut lines = BufReader::new(output).lines();
        loop {
            let line = tokio::time::timeout(std::time::Duration::from_secs(5), lines.next_line())
                .await
                .expect("no reply to subscribe")
                .unwrap()
                .expect("output closed before subscribe was answered");
            let reply: serde_json::Value = serde_json::from_str(&line).unwrap();
            if reply["kind"] == "subscribed" {
                break;
            }
        }

        drop(input);
        tokio::time::timeout(std::time::Duration::from_secs(5), session)
            .await
            .expect("session kept running after input closed")
            .unwrap();

        // The feed stays usable for other sessions.
        engine.subscribe_results(&poll_id).await.unwrap();
    }

    #[tokio::test]
    async fn forwarding_stops_on_shutdown() {
        let engine = engine().await;
        let poll_id = create(&engine).await;
        let (out, mut rx, shutdown) = outbox();

        let request = format!(r#"{{"op":"subscribe","poll_id":"{}"}}"#, poll_id);
        assert!(matches!(
            handle_line(&engine, &request, &out).await,
            Response::Subscribed { .. }
        ));
        assert!(matches!(rx.recv().await, Some(Response::Event { .. })));

        shutdown.send_replace(true);
        drop(out);
        let rest = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("forwarder kept its sender after shutdown");
        assert!(rest.is_none());
    }
}
