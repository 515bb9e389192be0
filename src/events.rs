//! Real-time log / progress channel
//!
//! A process-wide singleton broadcaster (Design Notes: "process-wide state
//! with explicit init/teardown"), backed by `tokio::sync::broadcast`.
//! Subscribers filter by deployment id or project id client-side; the
//! channel is best-effort — a lagging or dropped subscriber never affects
//! deployment progress.

use futures::Stream;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use uuid::Uuid;

const CHANNEL_CAPACITY: usize = 1024;

/// One of the three event kinds the pipeline runner and orchestrator emit.
#[derive(Debug, Clone)]
pub enum Event {
    DeploymentUpdated {
        deployment_id: Uuid,
        project_id: Uuid,
        status: String,
    },
    DeploymentLog {
        deployment_id: Uuid,
        project_id: Uuid,
        line: String,
    },
    DeploymentCompleted {
        deployment_id: Uuid,
        project_id: Uuid,
        status: String,
    },
}

impl Event {
    pub fn deployment_id(&self) -> Uuid {
        match self {
            Event::DeploymentUpdated { deployment_id, .. }
            | Event::DeploymentLog { deployment_id, .. }
            | Event::DeploymentCompleted { deployment_id, .. } => *deployment_id,
        }
    }

    pub fn project_id(&self) -> Uuid {
        match self {
            Event::DeploymentUpdated { project_id, .. }
            | Event::DeploymentLog { project_id, .. }
            | Event::DeploymentCompleted { project_id, .. } => *project_id,
        }
    }
}

/// The real-time channel. Construct once per process and share via `Arc`.
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish an event to all current subscribers. Best-effort: if there
    /// are no subscribers (or some have lagged off the channel), the send
    /// is simply a no-op rather than an error the caller needs to react to.
    pub fn publish(&self, event: Event) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to the firehose; callers filter by deployment/project id
    /// themselves (there is no separate per-room channel — a single
    /// broadcaster with many subscribers keeps this cheap).
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }

    /// Convenience wrapper: a stream of events for one deployment only.
    pub fn subscribe_deployment(&self, deployment_id: Uuid) -> DeploymentEventStream {
        DeploymentEventStream {
            receiver: self.subscribe(),
            deployment_id,
        }
    }

    /// Convenience wrapper: a stream of events for one project only.
    pub fn subscribe_project(&self, project_id: Uuid) -> ProjectEventStream {
        ProjectEventStream {
            receiver: self.subscribe(),
            project_id,
        }
    }

    /// A `futures::Stream` of every event belonging to one deployment, for
    /// callers that want to `.next().await` or combine it with other
    /// streams rather than drive the `recv`-loop themselves (e.g. an HTTP
    /// layer forwarding to an SSE/websocket response body). Lag and closed
    /// errors are swallowed the same way [`DeploymentEventStream::recv`]
    /// does, so a subscriber sees a plain stream of events with no
    /// broadcast-specific error variants leaking through.
    pub fn deployment_stream(&self, deployment_id: Uuid) -> impl Stream<Item = Event> {
        BroadcastStream::new(self.subscribe()).filter_map(move |item| match item {
            Ok(event) if event.deployment_id() == deployment_id => Some(event),
            _ => None,
        })
    }
}

/// Filters the shared broadcast receiver down to one deployment's events.
pub struct DeploymentEventStream {
    receiver: broadcast::Receiver<Event>,
    deployment_id: Uuid,
}

impl DeploymentEventStream {
    /// Wait for the next event belonging to this deployment, skipping and
    /// silently tolerating lag/closed errors from unrelated traffic.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.deployment_id() == self.deployment_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Filters the shared broadcast receiver down to one project's events.
pub struct ProjectEventStream {
    receiver: broadcast::Receiver<Event>,
    project_id: Uuid,
}

impl ProjectEventStream {
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if event.project_id() == self.project_id => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = EventBus::new();
        let deployment_id = Uuid::new_v4();
        let project_id = Uuid::new_v4();
        let mut stream = bus.subscribe_deployment(deployment_id);

        bus.publish(Event::DeploymentLog {
            deployment_id,
            project_id,
            line: "hello".to_string(),
        });

        let event = stream.recv().await.unwrap();
        match event {
            Event::DeploymentLog { line, .. } => assert_eq!(line, "hello"),
            _ => panic!("wrong event kind"),
        }
    }

    #[tokio::test]
    async fn deployment_stream_ignores_other_deployments() {
        let bus = EventBus::new();
        let target = Uuid::new_v4();
        let other = Uuid::new_v4();
        let project_id = Uuid::new_v4();
        let mut stream = bus.subscribe_deployment(target);

        bus.publish(Event::DeploymentLog {
            deployment_id: other,
            project_id,
            line: "not mine".to_string(),
        });
        bus.publish(Event::DeploymentLog {
            deployment_id: target,
            project_id,
            line: "mine".to_string(),
        });

        let event = stream.recv().await.unwrap();
        match event {
            Event::DeploymentLog { line, .. } => assert_eq!(line, "mine"),
            _ => panic!("wrong event kind"),
        }
    }

    #[tokio::test]
    async fn deployment_stream_yields_only_matching_events() {
        use futures::StreamExt as _;

        let bus = EventBus::new();
        let target = Uuid::new_v4();
        let other = Uuid::new_v4();
        let project_id = Uuid::new_v4();
        let mut stream = Box::pin(bus.deployment_stream(target));

        bus.publish(Event::DeploymentLog {
            deployment_id: other,
            project_id,
            line: "not mine".to_string(),
        });
        bus.publish(Event::DeploymentLog {
            deployment_id: target,
            project_id,
            line: "mine".to_string(),
        });

        let event = stream.next().await.unwrap();
        match event {
            Event::DeploymentLog { line, .. } => assert_eq!(line, "mine"),
            _ => panic!("wrong event kind"),
        }
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_error() {
        let bus = EventBus::new();
        bus.publish(Event::DeploymentUpdated {
            deployment_id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            status: "queued".to_string(),
        });
    }
}
