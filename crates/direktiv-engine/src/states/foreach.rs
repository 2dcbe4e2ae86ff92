use async_trait::async_trait;
use serde_json::Value;

use direktiv_core::error::{codes, DirektivError, Result};
use direktiv_core::expr;
use direktiv_core::model::{ForeachState, StateBase, StateType};

use super::branches::{BranchSet, Outcome, Resume};
use super::{action_input, expect_fresh, ChildInfo, StateLogic, StateRuntime, Transition};
use crate::engine::InstanceMemory;

pub(crate) struct ForeachLogic {
    state: ForeachState,
}

impl ForeachLogic {
    pub(crate) fn new(state: ForeachState) -> Self {
        Self { state }
    }

    fn items(&self, data: &Value) -> Result<Vec<Value>> {
        match expr::evaluate(&self.state.array, data)? {
            Value::Array(items) => Ok(items),
            other => Err(DirektivError::catchable(
                codes::FOREACH_INPUT,
                format!("foreach array expression produced {} instead of an array", kind(&other)),
            )),
        }
    }

    fn input(&self, data: &Value, item: &Value) -> Result<Value> {
        action_input(&self.state.action, data, item.clone(), &[("item", item)])
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[async_trait]
impl StateLogic for ForeachLogic {
    fn base(&self) -> &StateBase {
        &self.state.base
    }

    fn state_type(&self) -> StateType {
        StateType::Foreach
    }

    fn living_children(&self, im: &InstanceMemory) -> Vec<ChildInfo> {
        match BranchSet::load(im) {
            Ok(Some(set)) => set.living(),
            _ => Vec::new(),
        }
    }

    async fn run(
        &self,
        rt: &dyn StateRuntime,
        im: &mut InstanceMemory,
        wakedata: Option<Value>,
    ) -> Result<Option<Transition>> {
        let Some(mut set) = BranchSet::load(im)? else {
            expect_fresh(im, &wakedata)?;

            let items = self.items(im.data())?;
            if items.is_empty() {
                im.store_data("return", Value::Array(Vec::new()));
                return Ok(Some(Transition::from_base(&self.state.base)));
            }

            // Branches already dispatched stay on record so a failure can cancel them.
            let mut set = BranchSet::default();
            let mut dispatched = Ok(());
            for (i, item) in items.iter().enumerate() {
                dispatched = match self.input(im.data(), item) {
                    Ok(input) => set.dispatch(rt, im, i, &self.state.action, input, 0).await,
                    Err(e) => Err(e),
                };
                if dispatched.is_err() {
                    break;
                }
            }
            set.save(im)?;
            dispatched?;
            return Ok(None);
        };

        let resume = wakedata.and_then(Resume::parse);
        match resume {
            Some(Resume::Retry(index)) => {
                let Some(attempts) = set.retrying(index).map(|b| b.attempts) else {
                    tracing::warn!(instance = %im.id(), index, "Ignoring retry of a settled branch");
                    return Ok(None);
                };
                let items = self.items(im.data())?;
                let Some(item) = items.get(index) else {
                    return Err(DirektivError::internal(format!(
                        "foreach array no longer has element {}",
                        index
                    )));
                };
                let input = self.input(im.data(), item)?;
                set.dispatch(rt, im, index, &self.state.action, input, attempts)
                    .await?;
                set.save(im)?;
                Ok(None)
            }
            Some(Resume::Result(results)) => {
                let Some(index) = set.locate(&results.action_id) else {
                    tracing::warn!(instance = %im.id(), action = %results.action_id, "Ignoring results of an unknown branch");
                    return Ok(None);
                };

                let outcome = set
                    .record(rt, im, index, results, self.state.action.retries.as_ref())
                    .await?;
                set.save(im)?;

                match outcome {
                    Outcome::Failed(err) => Err(err),
                    Outcome::Retrying => Ok(None),
                    Outcome::Succeeded if set.all_complete() => {
                        im.store_data("return", Value::Array(set.outputs()));
                        Ok(Some(Transition::from_base(&self.state.base)))
                    }
                    Outcome::Succeeded => Ok(None),
                }
            }
            None => {
                tracing::warn!(instance = %im.id(), "Ignoring unreadable foreach wake data");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::testing::{failure, result, setup, MockRuntime};
    use serde_json::json;

    const YAML: &str = r#"
functions:
  - id: double
    type: reusable
    image: math
states:
  - id: each
    type: foreach
    array: "{{ numbers }}"
    action:
      function: double
      input:
        n: "{{ item }}"
        factor: "{{ factor }}"
      retries:
        max_attempts: 1
        codes: ["flaky"]
    transition: done
  - id: done
    type: noop
"#;

    #[tokio::test]
    async fn test_results_in_input_order() {
        let (logic, mut im) = setup(YAML, "each", json!({"numbers": [1, 2, 3], "factor": 2}));
        let rt = MockRuntime::default();

        assert!(logic.run(&rt, &mut im, None).await.unwrap().is_none());
        let ids = rt.dispatched_ids();
        assert_eq!(ids.len(), 3);
        assert_eq!(rt.last_dispatch().1, json!({"n": 3, "factor": 2}));
        assert_eq!(rt.last_dispatch().2.iterator, Some(2));

        // Results arrive out of order.
        for (id, out) in [(&ids[2], 6), (&ids[0], 2)] {
            let out = logic.run(&rt, &mut im, Some(result(id, json!(out)))).await.unwrap();
            assert!(out.is_none());
        }
        assert_eq!(logic.living_children(&im).len(), 1);

        let tr = logic
            .run(&rt, &mut im, Some(result(&ids[1], json!(4))))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(tr.next_state.as_deref(), Some("done"));
        assert_eq!(im.data()["return"], json!([2, 4, 6]));
    }

    #[tokio::test]
    async fn test_empty_array_returns_immediately() {
        let (logic, mut im) = setup(YAML, "each", json!({"numbers": []}));
        let rt = MockRuntime::default();
        let tr = logic.run(&rt, &mut im, None).await.unwrap().unwrap();
        assert_eq!(tr.next_state.as_deref(), Some("done"));
        assert_eq!(im.data()["return"], json!([]));
        assert!(rt.dispatched_ids().is_empty());
    }

    #[tokio::test]
    async fn test_non_array_is_catchable() {
        let (logic, mut im) = setup(YAML, "each", json!({"numbers": {"a": 1}}));
        let err = logic
            .run(&MockRuntime::default(), &mut im, None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(codes::FOREACH_INPUT));
    }

    #[tokio::test]
    async fn test_branch_retry_and_failure() {
        let (logic, mut im) = setup(YAML, "each", json!({"numbers": [1, 2], "factor": 1}));
        let rt = MockRuntime::default();
        logic.run(&rt, &mut im, None).await.unwrap();
        let ids = rt.dispatched_ids();

        logic
            .run(&rt, &mut im, Some(failure(&ids[0], Some("flaky"))))
            .await
            .unwrap();
        let (tag, _, data) = rt.wakeups.lock().unwrap()[0].clone();
        assert_eq!(tag, "retry-0");
        assert_eq!(logic.living_children(&im).len(), 1);

        logic.run(&rt, &mut im, Some(data)).await.unwrap();
        let (_, input, opts, retried) = rt.last_dispatch();
        assert_eq!(input, json!({"n": 1, "factor": 1}));
        assert_eq!(opts.attempt, 1);
        assert_eq!(opts.iterator, Some(0));

        let err = logic
            .run(&rt, &mut im, Some(failure(&retried, Some("fatal"))))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("fatal"));
        // The sibling is still running and must be cancelled by the engine.
        assert_eq!(logic.living_children(&im)[0].id, ids[1]);
    }
}
