use std::sync::Arc;

use crate::{
    domain::{FormattedPost, PartialThread, PostId, PublishResult, Service, SourceMessageId},
    errors::Error,
    ports::PublishingPort,
    retry::RetryPolicy,
    Result,
};

/// Progress through one thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishState {
    Pending,
    Posting(usize),
    Posted(usize),
    Complete,
    Failed(usize),
}

/// A publish that did not complete.
///
/// `partial` is set when at least one segment is live; persisting it lets the
/// next attempt continue the same thread.
#[derive(Debug)]
pub struct PublishFailure {
    pub error: Error,
    pub partial: Option<PartialThread>,
}

struct ThreadRun {
    message_id: SourceMessageId,
    state: PublishState,
    progress: PartialThread,
}

impl ThreadRun {
    fn transition(&mut self, next: PublishState) {
        tracing::debug!(
            message_id = %self.message_id,
            from = ?self.state,
            to = ?next,
            "publish state"
        );
        self.state = next;
    }
}

/// Posts formatted segments as a reply chain on the destination platform.
pub struct Publisher {
    port: Arc<dyn PublishingPort>,
    retry: RetryPolicy,
}

impl Publisher {
    pub fn new(port: Arc<dyn PublishingPort>, retry: RetryPolicy) -> Self {
        Self { port, retry }
    }

    /// Publish `post` as one thread.
    ///
    /// With `resume`, segments already live are not posted again: the thread
    /// continues from the first unposted segment of the stored texts.
    pub async fn publish(
        &self,
        message_id: SourceMessageId,
        post: &FormattedPost,
        resume: Option<&PartialThread>,
    ) -> std::result::Result<PublishResult, PublishFailure> {
        let progress = match resume {
            Some(p) if !p.posted.is_empty() && !p.segments.is_empty() => {
                tracing::info!(
                    %message_id,
                    posted = p.posted.len(),
                    total = p.segments.len(),
                    "resuming partially published thread"
                );
                p.clone()
            }
            _ => PartialThread {
                posted: Vec::new(),
                segments: post.texts(),
            },
        };

        if progress.segments.is_empty() {
            return Err(PublishFailure {
                error: Error::terminal(Service::Publishing, "nothing to publish"),
                partial: None,
            });
        }

        let mut run = ThreadRun {
            message_id,
            state: PublishState::Pending,
            progress,
        };

        let start = run.progress.posted.len();
        for i in start..run.progress.segments.len() {
            run.transition(PublishState::Posting(i));
            let reply_to = run.progress.last_posted().cloned();
            let text = run.progress.segments[i].clone();

            match self.post_with_refresh(&text, reply_to.as_ref()).await {
                Ok(id) => {
                    run.progress.posted.push(id);
                    run.transition(PublishState::Posted(i));
                }
                Err(error) => {
                    run.transition(PublishState::Failed(i));
                    let partial = if run.progress.posted.is_empty() {
                        None
                    } else {
                        Some(run.progress)
                    };
                    return Err(PublishFailure { error, partial });
                }
            }
        }

        run.transition(PublishState::Complete);
        let post_ids = run.progress.posted;
        Ok(PublishResult {
            root_post_id: post_ids[0].clone(),
            post_ids,
            success: true,
        })
    }

    /// One post with transient retries; an expired token gets exactly one
    /// refresh and one more try.
    async fn post_with_refresh(&self, text: &str, reply_to: Option<&PostId>) -> Result<PostId> {
        let first = self
            .retry
            .run(Service::Publishing, "post", || self.port.post(text, reply_to))
            .await;

        match first {
            Err(e) if e.is_auth_expired() => {
                tracing::warn!(error = %e, "publishing token expired, refreshing");
                self.retry
                    .run(Service::Publishing, "refresh auth", || self.port.refresh_auth())
                    .await?;

                match self
                    .retry
                    .run(Service::Publishing, "post", || self.port.post(text, reply_to))
                    .await
                {
                    Err(e) if e.is_auth_expired() => Err(Error::terminal(
                        Service::Publishing,
                        format!("authentication rejected after refresh: {e}"),
                    )),
                    other => other,
                }
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Segment;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct FakePlatform {
        /// Errors handed out by successive `post` calls; `None` means succeed.
        script: Mutex<Vec<Option<Error>>>,
        posts: Mutex<Vec<(String, Option<PostId>)>>,
        refreshes: Mutex<usize>,
        refresh_fails: bool,
    }

    impl FakePlatform {
        fn scripted(script: Vec<Option<Error>>) -> Self {
            Self {
                script: Mutex::new(script),
                ..Self::default()
            }
        }

        fn posts(&self) -> Vec<(String, Option<PostId>)> {
            self.posts.lock().unwrap().clone()
        }

        fn refreshes(&self) -> usize {
            *self.refreshes.lock().unwrap()
        }
    }

    #[async_trait]
    impl PublishingPort for FakePlatform {
        async fn post(&self, text: &str, in_reply_to: Option<&PostId>) -> Result<PostId> {
            let next = {
                let mut script = self.script.lock().unwrap();
                if script.is_empty() {
                    None
                } else {
                    script.remove(0)
                }
            };
            if let Some(e) = next {
                return Err(e);
            }
            let mut posts = self.posts.lock().unwrap();
            posts.push((text.to_string(), in_reply_to.cloned()));
            Ok(PostId(format!("tw{}", posts.len())))
        }

        async fn refresh_auth(&self) -> Result<()> {
            *self.refreshes.lock().unwrap() += 1;
            if self.refresh_fails {
                return Err(Error::terminal(Service::Publishing, "invalid_grant"));
            }
            Ok(())
        }
    }

    fn post_of(texts: &[&str]) -> FormattedPost {
        let total = texts.len();
        FormattedPost {
            segments: texts
                .iter()
                .enumerate()
                .map(|(i, t)| Segment {
                    position: i + 1,
                    total,
                    text: t.to_string(),
                })
                .collect(),
        }
    }

    fn publisher(port: Arc<FakePlatform>) -> Publisher {
        let retry = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
            attempt_timeout: Duration::from_secs(5),
        };
        Publisher::new(port, retry)
    }

    fn auth_expired() -> Option<Error> {
        Some(Error::auth_expired(Service::Publishing, "401"))
    }

    #[tokio::test]
    async fn posts_segments_as_reply_chain() {
        let port = Arc::new(FakePlatform::default());
        let res = publisher(port.clone())
            .publish(SourceMessageId(1), &post_of(&["a", "b", "c"]), None)
            .await
            .unwrap();

        assert_eq!(res.root_post_id, PostId("tw1".into()));
        assert_eq!(res.post_ids.len(), 3);
        assert!(res.success);
        assert_eq!(
            port.posts(),
            vec![
                ("a".to_string(), None),
                ("b".to_string(), Some(PostId("tw1".into()))),
                ("c".to_string(), Some(PostId("tw2".into()))),
            ]
        );
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_once() {
        let port = Arc::new(FakePlatform::scripted(vec![auth_expired()]));
        let res = publisher(port.clone())
            .publish(SourceMessageId(1), &post_of(&["a"]), None)
            .await
            .unwrap();
        assert_eq!(res.post_ids.len(), 1);
        assert_eq!(port.refreshes(), 1);
    }

    #[tokio::test]
    async fn still_expired_after_refresh_is_terminal() {
        let port = Arc::new(FakePlatform::scripted(vec![auth_expired(), auth_expired()]));
        let failure = publisher(port.clone())
            .publish(SourceMessageId(1), &post_of(&["a"]), None)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, Error::Terminal { .. }));
        assert!(failure.partial.is_none());
        assert_eq!(port.refreshes(), 1);
    }

    #[tokio::test]
    async fn failed_refresh_surfaces_error() {
        let port = Arc::new(FakePlatform {
            refresh_fails: true,
            ..FakePlatform::scripted(vec![auth_expired()])
        });
        let failure = publisher(port.clone())
            .publish(SourceMessageId(1), &post_of(&["a"]), None)
            .await
            .unwrap_err();
        assert!(matches!(failure.error, Error::Terminal { .. }));
        assert!(port.posts().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_retried_per_segment() {
        let port = Arc::new(FakePlatform::scripted(vec![
            None,
            Some(Error::transient(Service::Publishing, "503")),
        ]));
        let res = publisher(port.clone())
            .publish(SourceMessageId(1), &post_of(&["a", "b"]), None)
            .await
            .unwrap();
        assert_eq!(res.post_ids.len(), 2);
        assert_eq!(port.posts().len(), 2);
    }

    #[tokio::test]
    async fn mid_thread_failure_reports_partial_progress() {
        let port = Arc::new(FakePlatform::scripted(vec![
            None,
            Some(Error::terminal(Service::Publishing, "403 duplicate content")),
        ]));
        let failure = publisher(port.clone())
            .publish(SourceMessageId(7), &post_of(&["a", "b", "c"]), None)
            .await
            .unwrap_err();

        let partial = failure.partial.unwrap();
        assert_eq!(partial.posted, vec![PostId("tw1".into())]);
        assert_eq!(partial.segments, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn resume_posts_only_remaining_segments() {
        let port = Arc::new(FakePlatform::default());
        let partial = PartialThread {
            posted: vec![PostId("root".into())],
            segments: vec!["a".into(), "b".into(), "c".into()],
        };
        // The freshly formatted post differs; the stored texts win.
        let res = publisher(port.clone())
            .publish(SourceMessageId(7), &post_of(&["x", "y"]), Some(&partial))
            .await
            .unwrap();

        assert_eq!(res.root_post_id, PostId("root".into()));
        assert_eq!(res.post_ids.len(), 3);
        assert_eq!(
            port.posts(),
            vec![
                ("b".to_string(), Some(PostId("root".into()))),
                ("c".to_string(), Some(PostId("tw1".into()))),
            ]
        );
    }

    #[tokio::test]
    async fn resume_of_fully_posted_thread_posts_nothing() {
        let port = Arc::new(FakePlatform::default());
        let partial = PartialThread {
            posted: vec![PostId("r".into()), PostId("s".into())],
            segments: vec!["a".into(), "b".into()],
        };
        let res = publisher(port.clone())
            .publish(SourceMessageId(7), &post_of(&["a", "b"]), Some(&partial))
            .await
            .unwrap();
        assert_eq!(res.post_ids.len(), 2);
        assert!(port.posts().is_empty());
    }
}
