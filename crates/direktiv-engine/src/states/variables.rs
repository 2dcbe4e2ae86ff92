use async_trait::async_trait;
use serde_json::{Map, Value};

use direktiv_core::error::Result;
use direktiv_core::expr;
use direktiv_core::instance::DEFAULT_MIME_TYPE;
use direktiv_core::model::{GetterState, SetterState, StateBase, StateType};

use super::{expect_fresh, StateLogic, StateRuntime, Transition};
use crate::engine::InstanceMemory;

/// Key under which a getter exposes variables to the data document.
const VAR_KEY: &str = "var";

fn render_key(key: &Value, data: &Value) -> Result<String> {
    Ok(expr::render_log(&expr::evaluate(key, data)?))
}

pub(crate) struct GetterLogic {
    state: GetterState,
}

impl GetterLogic {
    pub(crate) fn new(state: GetterState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl StateLogic for GetterLogic {
    fn base(&self) -> &StateBase {
        &self.state.base
    }

    fn state_type(&self) -> StateType {
        StateType::Getter
    }

    async fn run(
        &self,
        rt: &dyn StateRuntime,
        im: &mut InstanceMemory,
        wakedata: Option<Value>,
    ) -> Result<Option<Transition>> {
        expect_fresh(im, &wakedata)?;

        let mut vars = match im.data().get(VAR_KEY) {
            Some(Value::Object(existing)) => existing.clone(),
            _ => Map::new(),
        };

        for getter in &self.state.variables {
            let key = render_key(&getter.key, im.data())?;
            let value = rt
                .get_variable(im, getter.scope, &key)
                .await?
                .unwrap_or(Value::Null);
            let name = getter.as_name.clone().unwrap_or_else(|| key.clone());
            vars.insert(name, value);
        }

        im.store_data(VAR_KEY, Value::Object(vars));
        Ok(Some(Transition::from_base(&self.state.base)))
    }
}

pub(crate) struct SetterLogic {
    state: SetterState,
}

impl SetterLogic {
    pub(crate) fn new(state: SetterState) -> Self {
        Self { state }
    }
}

#[async_trait]
impl StateLogic for SetterLogic {
    fn base(&self) -> &StateBase {
        &self.state.base
    }

    fn state_type(&self) -> StateType {
        StateType::Setter
    }

    async fn run(
        &self,
        rt: &dyn StateRuntime,
        im: &mut InstanceMemory,
        wakedata: Option<Value>,
    ) -> Result<Option<Transition>> {
        expect_fresh(im, &wakedata)?;

        for setter in &self.state.variables {
            let key = render_key(&setter.key, im.data())?;
            let value = expr::evaluate(&setter.value, im.data())?;
            let mime_type = setter.mime_type.as_deref().unwrap_or(DEFAULT_MIME_TYPE);
            rt.set_variable(im, setter.scope, &key, &value, mime_type)
                .await?;
        }

        Ok(Some(Transition::from_base(&self.state.base)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::testing::{setup, MockRuntime};
    use direktiv_core::model::VarScope;
    use serde_json::json;

    #[tokio::test]
    async fn test_setter_then_getter() {
        let setter = r#"
states:
  - id: set
    type: setter
    variables:
      - key: "counter-{{ name }}"
        scope: workflow
        value: "{{ count + 1 }}"
      - key: notes
        value: "hello"
        mimeType: text/plain
    transition: get
  - id: get
    type: getter
    variables:
      - key: "counter-{{ name }}"
        scope: workflow
        as: counter
      - key: missing
    transition: done
  - id: done
    type: noop
"#;
        let rt = MockRuntime::default();

        let (logic, mut im) = setup(setter, "set", json!({"name": "a", "count": 1}));
        logic.run(&rt, &mut im, None).await.unwrap().unwrap();
        {
            let vars = rt.variables.lock().unwrap();
            assert_eq!(vars["workflow/counter-a"].0, json!(2));
            assert_eq!(vars["instance/notes"], (json!("hello"), "text/plain".to_string()));
        }

        let (logic, mut im) = setup(
            setter,
            "get",
            json!({"name": "a", "var": {"kept": true}}),
        );
        let tr = logic.run(&rt, &mut im, None).await.unwrap().unwrap();
        assert_eq!(tr.next_state.as_deref(), Some("done"));
        assert_eq!(
            im.data()["var"],
            json!({"kept": true, "counter": 2, "missing": null})
        );
    }

    #[tokio::test]
    async fn test_setter_null_deletes() {
        let yaml = r#"
states:
  - id: set
    type: setter
    variables:
      - key: gone
        scope: namespace
        value: null
"#;
        let rt = MockRuntime::default();
        rt.variables
            .lock()
            .unwrap()
            .insert("namespace/gone".into(), (json!(1), DEFAULT_MIME_TYPE.into()));

        let (logic, mut im) = setup(yaml, "set", json!({}));
        logic.run(&rt, &mut im, None).await.unwrap();
        assert!(rt
            .get_variable(&im, VarScope::Namespace, "gone")
            .await
            .unwrap()
            .is_none());
    }
}
