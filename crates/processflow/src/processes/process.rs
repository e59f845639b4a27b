use chrono::Utc;

use crate::processes::dispatch::ClientDispatch;
use crate::processes::execution::{ExecutionContext, ExecutionOutcome, Transition};
use crate::processes::model::ClientProcess;

/// Capability required of anything that tracks a queued job.
///
/// Pending → Succeeded | Failed. Both terminal states absorb every later
/// `processed` call.
pub trait AsynchronousProcess {
    fn resource_type(&self) -> &str;

    /// `{resource_type}/{resource_id}` once the resource exists, unless the
    /// process failed.
    fn location(&self) -> Option<String>;

    fn is_pending(&self) -> bool;

    /// Populate the unsaved record from the descriptor. Called once, right
    /// before the job is handed to the queue.
    fn dispatching(&mut self, dispatch: &ClientDispatch);

    /// Apply the outcome of one execution attempt.
    fn processed(&mut self, execution: &ExecutionContext) -> Transition;

    /// Backfill the resource id of a pending process. Returns false when the
    /// id was already set or the process is terminal.
    fn resolved(&mut self, resource_id: &str) -> bool;
}

impl AsynchronousProcess for ClientProcess {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn location(&self) -> Option<String> {
        if self.failed {
            return None;
        }
        self.resource_id
            .as_deref()
            .map(|id| format!("{}/{}", self.resource_type, id))
    }

    fn is_pending(&self) -> bool {
        self.completed_at.is_none()
    }

    fn dispatching(&mut self, dispatch: &ClientDispatch) {
        self.api = dispatch.api().to_string();
        self.resource_type = dispatch.resource_type().to_string();
        self.resource_id = dispatch.resource_id().map(str::to_string);
        self.timeout = dispatch.timeout();
        self.timeout_at = dispatch.timeout_at();
        self.tries = dispatch.tries();
        self.updated_at = Utc::now();
    }

    fn processed(&mut self, execution: &ExecutionContext) -> Transition {
        if !self.is_pending() {
            return Transition::Absorbed;
        }

        let at = execution.finish_time();
        self.attempts = self.attempts.saturating_add(1);
        self.updated_at = at;

        match execution.outcome() {
            ExecutionOutcome::TransientFailure(_) => Transition::Retrying,
            ExecutionOutcome::Succeeded => {
                if let Some(id) = execution.resource_id() {
                    self.resolved(id);
                }
                self.completed_at = Some(at);
                self.failed = false;
                Transition::Succeeded
            }
            ExecutionOutcome::PermanentFailure(_) => {
                self.completed_at = Some(at);
                self.failed = true;
                Transition::Failed
            }
        }
    }

    fn resolved(&mut self, resource_id: &str) -> bool {
        if !self.is_pending() || self.resource_id.is_some() {
            return false;
        }
        self.resource_id = Some(resource_id.to_string());
        self.updated_at = Utc::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processes::dispatch::Operation;
    use crate::processes::error_codes::ErrorCode;
    use crate::processes::execution::ExecutionFailure;
    use chrono::Duration;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn dispatched(dispatch: &ClientDispatch) -> ClientProcess {
        let mut p = ClientProcess::new(Uuid::new_v4());
        p.dispatching(dispatch);
        p
    }

    fn transient() -> ExecutionContext {
        ExecutionContext::transient(ExecutionFailure::new(ErrorCode::Timeout, "slow"))
    }

    fn permanent() -> ExecutionContext {
        ExecutionContext::permanent(ExecutionFailure::new(ErrorCode::BadPayload, "bad"))
    }

    #[test]
    fn dispatching_articles_create_populates_pending_record() {
        let now = Utc::now();
        let d = ClientDispatch::new("v1", "articles", Operation::Create)
            .with_timeout(Some(30))
            .with_tries(Some(3))
            .dispatched_at(now);

        let p = dispatched(&d);

        assert_eq!(p.resource_type(), "articles");
        assert_eq!(p.api(), "v1");
        assert_eq!(p.resource_id(), None);
        assert_eq!(p.timeout(), Some(30));
        assert_eq!(p.timeout_at(), Some(now + Duration::seconds(30)));
        assert_eq!(p.tries(), Some(3));
        assert_eq!(p.attempts(), 0);
        assert_eq!(p.completed_at(), None);
        assert!(!p.failed());
        assert!(p.is_pending());
    }

    #[test]
    fn three_transient_failures_then_success() {
        let d = ClientDispatch::new("v1", "articles", Operation::Create).with_tries(Some(5));
        let mut p = dispatched(&d);

        for _ in 0..3 {
            assert_eq!(p.processed(&transient()), Transition::Retrying);
            assert!(p.is_pending());
        }
        assert_eq!(
            p.processed(&ExecutionContext::succeeded().with_resource_id("42")),
            Transition::Succeeded
        );

        assert_eq!(p.attempts(), 4);
        assert!(p.completed_at().is_some());
        assert!(!p.failed());
        assert_eq!(p.location().as_deref(), Some("articles/42"));
    }

    #[test]
    fn success_is_absorbing() {
        let mut p = dispatched(
            &ClientDispatch::new("v1", "articles", Operation::Update).with_resource_id("1"),
        );

        p.processed(&ExecutionContext::succeeded());
        let completed_at = p.completed_at();

        for ctx in [transient(), permanent(), ExecutionContext::succeeded()] {
            let later = ctx.finished_at(Utc::now() + Duration::hours(1));
            assert_eq!(p.processed(&later), Transition::Absorbed);
            assert_eq!(p.completed_at(), completed_at);
            assert!(!p.failed());
            assert_eq!(p.attempts(), 1);
        }
    }

    #[test]
    fn permanent_failure_is_absorbing_and_hides_location() {
        let mut p = dispatched(
            &ClientDispatch::new("v1", "articles", Operation::Update).with_resource_id("1"),
        );

        assert_eq!(p.processed(&permanent()), Transition::Failed);
        let completed_at = p.completed_at();
        assert!(p.failed());
        assert_eq!(p.location(), None);

        assert_eq!(p.processed(&ExecutionContext::succeeded()), Transition::Absorbed);
        assert_eq!(p.completed_at(), completed_at);
        assert!(p.failed());
    }

    #[test]
    fn resolved_only_backfills_once_while_pending() {
        let mut p = dispatched(&ClientDispatch::new("v1", "articles", Operation::Create));
        assert_eq!(p.location(), None);

        assert!(p.resolved("9"));
        assert!(!p.resolved("10"));
        assert_eq!(p.resource_id(), Some("9"));

        // a success carrying a different id does not overwrite
        p.processed(&ExecutionContext::succeeded().with_resource_id("11"));
        assert_eq!(p.resource_id(), Some("9"));
        assert!(!p.resolved("12"));
    }

    #[test]
    fn update_dispatch_keeps_known_resource_id() {
        let p = dispatched(
            &ClientDispatch::new("v1", "comments", Operation::Delete).with_resource_id("5"),
        );
        assert_eq!(p.resource_id(), Some("5"));
        // pending, but the location is already resolvable
        assert_eq!(p.location().as_deref(), Some("comments/5"));
    }

    fn dispatch_strategy() -> impl Strategy<Value = ClientDispatch> {
        (
            "[a-z][a-z-]{0,15}",
            proptest::option::of("[0-9]{1,6}"),
            proptest::option::of(1i32..3600),
            proptest::option::of(1i32..20),
        )
            .prop_map(|(rt, rid, timeout, tries)| {
                let d = ClientDispatch::new("v1", rt, Operation::Create)
                    .with_timeout(timeout)
                    .with_tries(tries);
                match rid {
                    Some(id) => d.with_resource_id(id),
                    None => d,
                }
            })
    }

    fn context_strategy() -> impl Strategy<Value = ExecutionContext> {
        prop_oneof![
            Just(ExecutionContext::succeeded()),
            Just(transient()),
            Just(permanent()),
        ]
    }

    proptest! {
        #[test]
        fn dispatching_always_starts_pending(d in dispatch_strategy()) {
            let p = dispatched(&d);
            prop_assert!(p.is_pending());
            prop_assert_eq!(p.resource_type(), d.resource_type());
            prop_assert!(p.completed_at().is_none());
            prop_assert!(!p.failed());
        }

        #[test]
        fn transient_failures_only_count_attempts(d in dispatch_strategy(), n in 0usize..25) {
            let mut p = dispatched(&d);
            for i in 0..n {
                p.processed(&transient());
                prop_assert_eq!(p.attempts() as usize, i + 1);
                prop_assert!(p.completed_at().is_none());
                prop_assert!(!p.failed());
            }
        }

        #[test]
        fn attempts_never_decrease_and_terminal_never_changes(
            d in dispatch_strategy(),
            ctxs in proptest::collection::vec(context_strategy(), 0..30),
        ) {
            let mut p = dispatched(&d);
            let mut terminal: Option<(Option<chrono::DateTime<Utc>>, bool)> = None;

            for ctx in &ctxs {
                let before = p.attempts();
                p.processed(ctx);
                prop_assert!(p.attempts() >= before);
                prop_assert!(!p.failed() || p.completed_at().is_some());

                match terminal {
                    Some(t) => prop_assert_eq!(t, (p.completed_at(), p.failed())),
                    None if !p.is_pending() => terminal = Some((p.completed_at(), p.failed())),
                    None => {}
                }
            }
        }
    }
}
