//! Subscription protocol: every subscriber gets its own unbounded queue fed
//! by the build under its state lock, so events reach each subscriber in
//! the order they happened, none dropped or duplicated.

use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tracing::{debug, warn};

use annotate_shared::Status;

use crate::build::{Build, Progress};
use crate::fingerprint::Fingerprint;
use crate::result::BuildResult;

/// Event broadcast by a build to its subscriber queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildEvent {
    StatusChanged(Status),
    Progress(Progress),
}

/// What a subscriber observes.
#[derive(Debug, Clone)]
pub enum Update {
    Status(Status),
    Progress(Progress),
    /// Terminal item: the build's final payload.
    Finished(BuildResult),
}

/// A caller's view of one build.
#[derive(Debug)]
pub struct Subscriber {
    build: Arc<Build>,
    rx: Option<UnboundedReceiver<BuildEvent>>,
    want_progress: bool,
    result_pending: bool,
    done: bool,
}

/// Register interest in `build`.
///
/// A build that has already finished registers no queue; the subscriber
/// yields the result straight away. Joining a running build with progress
/// requested first yields a snapshot of the current progress.
pub fn subscribe(build: &Arc<Build>, want_progress: bool) -> Subscriber {
    let mut subscriber = Subscriber {
        build: Arc::clone(build),
        rx: None,
        want_progress,
        result_pending: false,
        done: false,
    };

    let mut state = build.state();
    match state.status {
        status if status.is_finished() => subscriber.result_pending = true,
        Status::Deleted => subscriber.done = true,
        status => {
            let (tx, rx) = unbounded_channel();
            if want_progress && status == Status::Running {
                let _ = tx.send(BuildEvent::Progress(state.progress.clone()));
            }
            state.subscribers.push(tx);
            subscriber.rx = Some(rx);
        }
    }
    drop(state);

    debug!(fingerprint = %build.fingerprint(), want_progress, "subscribed");
    subscriber
}

impl Subscriber {
    pub fn fingerprint(&self) -> &Fingerprint {
        self.build.fingerprint()
    }

    pub fn build(&self) -> &Arc<Build> {
        &self.build
    }

    /// Next update, or `None` once the result has been delivered or the
    /// build was deleted.
    pub async fn next(&mut self) -> Option<Update> {
        if self.done {
            return None;
        }
        if self.result_pending {
            self.result_pending = false;
            self.done = true;
            return match self.build.result() {
                Ok(result) => Some(Update::Finished(result)),
                Err(e) => {
                    warn!(fingerprint = %self.build.fingerprint(), error = %e, "no result for finished build");
                    None
                }
            };
        }

        loop {
            let event = match self.rx.as_mut() {
                Some(rx) => rx.recv().await,
                None => None,
            };

            match event {
                Some(BuildEvent::StatusChanged(status)) => {
                    if status.is_finished() {
                        self.result_pending = true;
                        self.rx = None;
                    } else if status == Status::Deleted {
                        self.done = true;
                        self.rx = None;
                    }
                    return Some(Update::Status(status));
                }
                Some(BuildEvent::Progress(progress)) => {
                    if self.want_progress {
                        return Some(Update::Progress(progress));
                    }
                }
                None => {
                    self.done = true;
                    return None;
                }
            }
        }
    }

    /// Wait until the build has finished or was deleted and return its
    /// status. Unlike [`Subscriber::wait`] this does not assemble the
    /// result, so it is not an access and skips the output checks that may
    /// still downgrade `Done`.
    pub async fn settled(mut self) -> Status {
        self.want_progress = false;
        while !self.result_pending && !self.done {
            if self.next().await.is_none() {
                break;
            }
        }
        self.build.status()
    }

    /// Drain the remaining updates and return the final result, if any.
    pub async fn wait(mut self) -> Option<BuildResult> {
        while let Some(update) = self.next().await {
            if let Update::Finished(result) = update {
                return Some(result);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use annotate_shared::BuildMode;

    use crate::build::{Submission, TEXT_DOCUMENT};
    use crate::input::Document;
    use crate::layout::BuildLayout;

    fn build_in(root: &std::path::Path) -> Arc<Build> {
        let fp = Fingerprint::compute("<text>x</text>", "s", &[] as &[&str]);
        Arc::new(Build::fresh(
            fp.clone(),
            BuildMode::Text,
            BuildLayout::new(root.join(fp.as_str())),
            "http://localhost:8801",
            Submission {
                documents: vec![Document {
                    name: TEXT_DOCUMENT.into(),
                    content: "<text>x</text>".into(),
                }],
                script: "s".into(),
                settings_json: "{}".into(),
            },
        ))
    }

    fn scratch() -> std::path::PathBuf {
        std::env::temp_dir().join(format!("annotate-notifier-{}", uuid::Uuid::now_v7()))
    }

    fn progress(step: u32, steps: u32, command: &str) -> Progress {
        Progress {
            command: command.into(),
            step,
            steps,
        }
    }

    #[tokio::test]
    async fn subscribers_see_every_event_in_order() {
        let root = scratch();
        let build = build_in(&root);
        let mut a = subscribe(&build, true);
        let mut b = subscribe(&build, false);

        build.change_status(Status::Parsing);
        build.change_status(Status::Running);
        build.change_step(Some(""), Some(0), Some(3));
        build.change_step(Some("tools.segment"), Some(1), None);
        build.change_status(Status::Error);

        let mut seen = Vec::new();
        while let Some(update) = a.next().await {
            seen.push(update);
        }
        assert!(matches!(seen[0], Update::Status(Status::Parsing)));
        assert!(matches!(seen[1], Update::Status(Status::Running)));
        assert!(matches!(&seen[2], Update::Progress(p) if *p == progress(0, 3, "")));
        assert!(matches!(&seen[3], Update::Progress(p) if *p == progress(1, 3, "tools.segment")));
        assert!(matches!(seen[4], Update::Status(Status::Error)));
        assert!(matches!(&seen[5], Update::Finished(r) if r.status == Status::Error));
        assert_eq!(seen.len(), 6);

        // Without progress only status changes and the result come through.
        let mut statuses = Vec::new();
        while let Some(update) = b.next().await {
            match update {
                Update::Status(s) => statuses.push(s),
                Update::Finished(_) => statuses.push(Status::Done),
                Update::Progress(_) => panic!("progress not requested"),
            }
        }
        assert_eq!(
            statuses,
            vec![Status::Parsing, Status::Running, Status::Error, Status::Done]
        );

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn settling_does_not_count_as_access() {
        let root = scratch();
        let build = build_in(&root);
        build.backdate(std::time::Duration::from_secs(7200));

        let pending = subscribe(&build, true);
        build.change_status(Status::Running);
        build.change_step(Some(""), Some(0), Some(2));
        build.change_status(Status::Done);
        assert_eq!(pending.settled().await, Status::Done);

        assert_eq!(subscribe(&build, false).settled().await, Status::Done);
        assert!(build.idle() >= std::time::Duration::from_secs(7200));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn late_join_gets_progress_snapshot_first() {
        let root = scratch();
        let build = build_in(&root);
        build.change_status(Status::Running);
        build.change_step(Some("tools.export"), Some(2), Some(4));

        let mut sub = subscribe(&build, true);
        build.change_step(None, Some(3), None);

        match sub.next().await {
            Some(Update::Progress(p)) => assert_eq!(p, progress(2, 4, "tools.export")),
            other => panic!("expected snapshot, got {other:?}"),
        }
        match sub.next().await {
            Some(Update::Progress(p)) => assert_eq!(p.step, 3),
            other => panic!("expected increment, got {other:?}"),
        }

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn joining_finished_build_yields_result_only() {
        let root = scratch();
        let build = build_in(&root);
        build.change_status(Status::ParseError);

        let mut sub = subscribe(&build, true);
        assert!(build.state().subscribers.is_empty());
        match sub.next().await {
            Some(Update::Finished(result)) => assert_eq!(result.status, Status::ParseError),
            other => panic!("expected result, got {other:?}"),
        }
        assert!(sub.next().await.is_none());

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn dropped_subscriber_is_pruned() {
        let root = scratch();
        let build = build_in(&root);
        let kept = subscribe(&build, true);
        let dropped = subscribe(&build, true);
        assert_eq!(build.state().subscribers.len(), 2);

        drop(dropped);
        build.change_status(Status::Parsing);
        assert_eq!(build.state().subscribers.len(), 1);
        drop(kept);

        let _ = std::fs::remove_dir_all(&root);
    }

    #[tokio::test]
    async fn deletion_ends_subscription() {
        let root = scratch();
        let build = build_in(&root);
        let mut sub = subscribe(&build, false);
        build.change_status(Status::Deleted);

        assert!(matches!(sub.next().await, Some(Update::Status(Status::Deleted))));
        assert!(sub.next().await.is_none());

        let _ = std::fs::remove_dir_all(&root);
    }
}
