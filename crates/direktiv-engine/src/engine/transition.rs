//! The transition pipeline: enter a state, run it, interpret the result.

use chrono::Utc;
use serde_json::{json, Value};

use direktiv_core::duration;
use direktiv_core::error::{codes, DirektivError, INTERNAL_ERROR_MESSAGE};
use direktiv_core::expr;
use direktiv_core::instance::{ActionResultPayload, InstanceLogEntry, InstanceStatus, MessageKind};
use direktiv_core::timer::{names, TimeoutPayload, TIMEOUT_FUNCTION};

use super::{Deferred, Engine, InstanceMemory};
use crate::states::{self, StateRuntime};

/// Next thing the drive loop does with a locked instance.
pub(crate) enum Step {
    /// Enter a state as a new step.
    Transition { state: String, attempt: u32 },
    /// Run the current state, or go straight to failure handling.
    Run {
        wakedata: Option<Value>,
        error: Option<DirektivError>,
    },
}

impl Engine {
    /// Advance a locked instance until it suspends or terminates.
    pub(crate) async fn drive(&self, im: &mut InstanceMemory, mut step: Step) {
        loop {
            let next = match step {
                Step::Transition { state, attempt } => self.enter_state(im, &state, attempt).await,
                Step::Run { wakedata, error } => self.run_state(im, wakedata, error).await,
            };
            match next {
                Some(next) => step = next,
                None => break,
            }
        }
    }

    async fn enter_state(&self, im: &mut InstanceMemory, state_id: &str, attempt: u32) -> Option<Step> {
        let id = im.id();
        let hostname = self.inner.hostname.clone();

        if im.step() == 0 {
            if let Err(e) = self.schedule_workflow_deadlines(im) {
                return Some(Step::Run { wakedata: None, error: Some(e) });
            }
        }

        let Some(state) = im.workflow().state(state_id) else {
            im.logic = None;
            im.clear_memory();
            return Some(Step::Run {
                wakedata: None,
                error: Some(DirektivError::uncatchable(
                    codes::UNKNOWN_STATE,
                    format!("workflow has no state '{}'", state_id),
                )),
            });
        };
        let logic = states::build(&state);

        let now = Utc::now();
        let deadline = match duration::parse(&self.inner.config.soft_timeout)
            .and_then(|default| logic.deadline(now, default))
        {
            Ok(deadline) => deadline,
            Err(e) => {
                im.logic = None;
                im.clear_memory();
                return Some(Step::Run { wakedata: None, error: Some(e) });
            }
        };

        im.runtime.flow.push(state_id.to_string());
        im.runtime.state_begin_time = now;
        im.runtime.attempts = attempt;
        im.runtime.deadline = Some(deadline);
        im.runtime.controller = hostname.clone();
        im.runtime.updated_at = now;
        im.clear_memory();
        im.logic = Some(logic);

        if let Err(e) = self.inner.store.update_runtime(&im.runtime).await {
            return Some(Step::Run { wakedata: None, error: Some(e) });
        }
        self.inner.bus.notify(&id.to_string());

        let step = im.step();
        tracing::debug!(instance = %id, step, state = %state_id, attempt, "Entering state");

        if step > 1 {
            self.inner.timers.delete_timer_by_name(
                &im.previous_controller,
                &hostname,
                &names::timeout(id, true, step - 1),
            );
        }
        im.previous_controller = hostname;

        let payload = TimeoutPayload {
            instance_id: id,
            step,
            soft: true,
        };
        let scheduled = serde_json::to_value(&payload)
            .map_err(DirektivError::from)
            .and_then(|payload| {
                self.inner.timers.add_one_shot(
                    &names::timeout(id, true, step),
                    TIMEOUT_FUNCTION,
                    deadline,
                    payload,
                )
            });
        if let Err(e) = scheduled {
            return Some(Step::Run { wakedata: None, error: Some(e) });
        }

        Some(Step::Run { wakedata: None, error: None })
    }

    /// Schedule the whole-workflow soft and hard deadlines.
    fn schedule_workflow_deadlines(&self, im: &InstanceMemory) -> direktiv_core::Result<()> {
        let id = im.id();
        let now = Utc::now();
        let config = &self.inner.config;
        let workflow = im.workflow();

        let soft = duration::add(
            now,
            duration::parse_or(workflow.interrupt_timeout(), &config.soft_timeout)?,
        )?;
        let hard = duration::add(
            now,
            duration::parse_or(workflow.kill_timeout(), &config.hard_timeout)?,
        )?;

        for (soft_kind, at) in [(true, soft), (false, hard)] {
            let payload = serde_json::to_value(TimeoutPayload {
                instance_id: id,
                step: 0,
                soft: soft_kind,
            })?;
            self.inner
                .timers
                .add_one_shot(&names::timeout(id, soft_kind, 0), TIMEOUT_FUNCTION, at, payload)?;
        }
        Ok(())
    }

    async fn run_state(
        &self,
        im: &mut InstanceMemory,
        wakedata: Option<Value>,
        error: Option<DirektivError>,
    ) -> Option<Step> {
        if let Some(err) = error {
            return self.fail_state(im, err).await;
        }

        let Some(logic) = im.logic.clone() else {
            return self
                .fail_state(im, DirektivError::internal("instance has no active state"))
                .await;
        };

        if im.get_memory().is_none() && wakedata.is_none() {
            if let Some(log) = logic.log_expr() {
                match expr::evaluate(log, im.data()) {
                    Ok(value) => self.log_to_instance(im, "info", expr::render_log(&value)).await,
                    Err(e) => return self.fail_state(im, e).await,
                }
            }
        }

        let result = match im.cancel_token() {
            Some(token) => {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => None,
                    result = logic.run(self, im, wakedata) => Some(result),
                }
            }
            None => Some(logic.run(self, im, wakedata).await),
        };

        let Some(result) = result else {
            tracing::info!(instance = %im.id(), state = %logic.id(), "State interrupted");
            im.take_deferred();
            return None;
        };

        match result {
            Err(err) => self.fail_state(im, err).await,
            Ok(None) => {
                im.runtime.updated_at = Utc::now();
                if let Err(e) = self.inner.store.update_runtime(&im.runtime).await {
                    return self.fail_state(im, e).await;
                }
                tracing::debug!(instance = %im.id(), state = %logic.id(), "State suspended");
                None
            }
            Ok(Some(transition)) => {
                if let Some(transform) = &transition.transform {
                    match expr::evaluate_object(transform, im.data()) {
                        Ok(data) => im.set_data(Value::Object(data)),
                        Err(e) => return self.fail_state(im, e).await,
                    }
                }
                match transition.next_state {
                    Some(state) => Some(Step::Transition { state, attempt: 0 }),
                    None => {
                        self.terminate(im, None).await;
                        None
                    }
                }
            }
        }
    }

    /// Cancel children, then try catchers in order; anything uncaught ends the instance.
    async fn fail_state(&self, im: &mut InstanceMemory, err: DirektivError) -> Option<Step> {
        let Some(logic) = im.logic.clone() else {
            self.terminate(im, Some(err)).await;
            return None;
        };

        let children = logic.living_children(im);
        if !children.is_empty() {
            self.cancel_children(im, children).await;
        }

        if let Some(code) = err.code().filter(|_| err.is_catchable()) {
            if let Some(catcher) = logic.error_catchers().iter().find(|c| c.matches(code)) {
                tracing::info!(
                    instance = %im.id(),
                    state = %logic.id(),
                    code,
                    target = ?catcher.transition,
                    "Error caught"
                );
                self.log_to_instance(im, "error", format!("caught error {}: {}", code, err.public_message()))
                    .await;
                im.store_data("error", json!({ "code": code, "msg": err.public_message() }));

                return match &catcher.transition {
                    Some(state) => Some(Step::Transition {
                        state: state.clone(),
                        attempt: 0,
                    }),
                    None => {
                        self.terminate(im, Some(err)).await;
                        None
                    }
                };
            }
        }

        self.terminate(im, Some(err)).await;
        None
    }

    /// Record the final outcome and release everything the instance holds.
    async fn terminate(&self, im: &mut InstanceMemory, err: Option<DirektivError>) {
        let id = im.id();
        let now = Utc::now();

        match &err {
            None => {
                im.instance.status = InstanceStatus::Complete;
                im.instance.output = Some(im.data().clone());
                tracing::info!(instance = %id, "Instance completed");
            }
            Some(e) if e.is_internal() => {
                im.instance.status = InstanceStatus::Crashed;
                im.instance.error_code = Some(codes::INTERNAL.to_string());
                im.instance.error_message = Some(INTERNAL_ERROR_MESSAGE.to_string());
                tracing::error!(instance = %id, state = ?im.current_state(), error = %e, "Instance crashed");
            }
            Some(e) => {
                im.instance.status = InstanceStatus::Failed;
                im.instance.error_code = e.code().map(str::to_string);
                im.instance.error_message = Some(e.public_message());
                tracing::info!(instance = %id, code = ?e.code(), message = %e.public_message(), "Instance failed");
            }
        }
        im.instance.updated_at = now;
        im.instance.ended_at = Some(now);
        im.runtime.updated_at = now;

        let summary = match im.instance.status {
            InstanceStatus::Complete => "workflow completed".to_string(),
            status => format!(
                "workflow {}: {}",
                status,
                im.instance.error_message.clone().unwrap_or_default()
            ),
        };
        self.log_to_instance(im, "info", summary).await;

        if let Err(e) = self.inner.store.update_instance(&im.instance).await {
            tracing::error!(instance = %id, error = %e, "Failed to persist final status");
        }
        if let Err(e) = self.inner.store.update_runtime(&im.runtime).await {
            tracing::error!(instance = %id, error = %e, "Failed to persist final data");
        }

        self.inner.timers.delete_instance_timers_everywhere(id);
        if let Err(e) = self.inner.store.delete_event_listeners(id).await {
            tracing::warn!(instance = %id, error = %e, "Failed to delete event listeners");
        }

        if let Some(caller) = im.runtime.caller.clone() {
            let results = match im.instance.status {
                InstanceStatus::Complete => ActionResultPayload {
                    action_id: id.to_string(),
                    output: im.data().clone(),
                    ..Default::default()
                },
                InstanceStatus::Crashed => ActionResultPayload {
                    action_id: id.to_string(),
                    error_message: Some(format!("subflow {} crashed", id)),
                    ..Default::default()
                },
                _ => ActionResultPayload {
                    action_id: id.to_string(),
                    error_code: im.instance.error_code.clone(),
                    error_message: im.instance.error_message.clone(),
                    output: Value::Null,
                },
            };
            match serde_json::to_value(&results) {
                Ok(payload) => im.defer(Deferred::Message {
                    instance_id: caller.instance_id,
                    kind: MessageKind::Action,
                    payload,
                }),
                Err(e) => tracing::error!(instance = %id, error = %e, "Failed to encode subflow result"),
            }
        }

        self.inner.bus.notify(&id.to_string());
    }

    /// Unlock the instance and run everything deferred while it was locked.
    pub(crate) async fn release(&self, im: &mut InstanceMemory) {
        if let Some(lock) = im.lock.take() {
            if let Err(e) = self.inner.locks.unlock_instance(lock).await {
                tracing::warn!(instance = %im.id(), error = %e, "Failed to release instance lock");
            }
        }

        for work in im.take_deferred() {
            self.flush(im.id(), work).await;
        }

        let namespace = im.namespace().to_string();
        for event in im.take_staged_events() {
            if let Err(e) = self.broadcast_event(&namespace, event).await {
                tracing::warn!(instance = %im.id(), error = %e, "Failed to deliver generated event");
            }
        }
    }

    async fn flush(&self, owner: uuid::Uuid, work: Deferred) {
        match work {
            Deferred::Invoke(request) => {
                let action_id = request.action_id.clone();
                let asynchronous = request.asynchronous;
                if let Err(e) = self.inner.invoker.invoke(request).await {
                    tracing::warn!(instance = %owner, action = %action_id, error = %e, "Function dispatch failed");
                    if asynchronous {
                        return;
                    }
                    let results = ActionResultPayload {
                        action_id,
                        error_code: Some(codes::DISPATCH_FAILED.to_string()),
                        error_message: Some(e.to_string()),
                        output: Value::Null,
                    };
                    if let Err(e) = self.report_action_result(owner, results).await {
                        tracing::error!(instance = %owner, error = %e, "Failed to report dispatch failure");
                    }
                }
            }
            Deferred::StartChild(child) => {
                tokio::spawn(self.start(*child));
            }
            Deferred::CancelAction(action_id) => {
                if let Err(e) = self.inner.invoker.cancel(&action_id).await {
                    tracing::debug!(instance = %owner, action = %action_id, error = %e, "Function cancel failed");
                }
            }
            Deferred::Message {
                instance_id,
                kind,
                payload,
            } => {
                if let Err(e) = self.enqueue_instance_message(instance_id, kind, payload).await {
                    tracing::warn!(instance = %instance_id, kind = kind.as_str(), error = %e, "Failed to deliver instance message");
                }
            }
        }
    }

    /// Append a line to the instance's log stream.
    pub(crate) async fn log_to_instance(&self, im: &InstanceMemory, level: &str, message: String) {
        tracing::info!(instance = %im.id(), step = im.step(), level, "{}", message);
        let entry = InstanceLogEntry {
            instance_id: im.id(),
            time: Utc::now(),
            level: level.to_string(),
            message,
        };
        if let Err(e) = self.inner.store.append_instance_log(&entry).await {
            tracing::warn!(instance = %im.id(), error = %e, "Failed to append instance log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_shapes() {
        let step = Step::Transition {
            state: "a".into(),
            attempt: 2,
        };
        assert!(matches!(step, Step::Transition { attempt: 2, .. }));
        let step = Step::Run {
            wakedata: None,
            error: Some(DirektivError::internal("x")),
        };
        assert!(matches!(step, Step::Run { error: Some(_), .. }));
    }
}
