use async_trait::async_trait;
use serde_json::Value;

use direktiv_core::error::{DirektivError, Result};
use direktiv_core::expr;
use direktiv_core::model::{ErrorState, StateBase, StateType};

use super::{expect_fresh, StateLogic, StateRuntime, Transition};
use crate::engine::InstanceMemory;

pub(crate) struct ErrorLogic {
    state: ErrorState,
}

impl ErrorLogic {
    pub(crate) fn new(state: ErrorState) -> Self {
        Self { state }
    }
}

/// Fill `%v` and `%s` placeholders in order; surplus placeholders stay as-is.
fn format_message(template: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut args = args.iter();
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '%' {
            match chars.peek() {
                Some('v') | Some('s') => {
                    let verb = chars.next().unwrap_or('v');
                    match args.next() {
                        Some(arg) => out.push_str(arg),
                        None => {
                            out.push('%');
                            out.push(verb);
                        }
                    }
                    continue;
                }
                Some('%') => {
                    chars.next();
                    out.push('%');
                    continue;
                }
                _ => {}
            }
        }
        out.push(c);
    }

    out
}

#[async_trait]
impl StateLogic for ErrorLogic {
    fn base(&self) -> &StateBase {
        &self.state.base
    }

    fn state_type(&self) -> StateType {
        StateType::Error
    }

    async fn run(
        &self,
        _rt: &dyn StateRuntime,
        im: &mut InstanceMemory,
        wakedata: Option<Value>,
    ) -> Result<Option<Transition>> {
        expect_fresh(im, &wakedata)?;

        let args = self
            .state
            .args
            .iter()
            .map(|arg| expr::evaluate(arg, im.data()).map(|v| expr::render_log(&v)))
            .collect::<Result<Vec<_>>>()?;

        Err(DirektivError::catchable(
            self.state.error.clone(),
            format_message(&self.state.message, &args),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::states::testing::{setup, MockRuntime};
    use serde_json::json;

    #[test]
    fn test_format_message() {
        let args = vec!["a".to_string(), "2".to_string()];
        assert_eq!(format_message("%v and %s", &args), "a and 2");
        assert_eq!(format_message("%v %v %v", &args), "a 2 %v");
        assert_eq!(format_message("100%% of %v", &args), "100% of a");
        assert_eq!(format_message("plain", &[]), "plain");
    }

    #[tokio::test]
    async fn test_error_state_raises_catchable() {
        let yaml = r#"
states:
  - id: fail
    type: error
    error: order.invalid
    message: "order %v has %v items"
    args:
      - "{{ order.id }}"
      - "{{ order.items | length }}"
"#;
        let (logic, mut im) = setup(yaml, "fail", json!({"order": {"id": "o-1", "items": [1, 2]}}));
        let err = logic
            .run(&MockRuntime::default(), &mut im, None)
            .await
            .unwrap_err();
        assert!(err.is_catchable());
        assert_eq!(err.code(), Some("order.invalid"));
        assert_eq!(err.public_message(), "order o-1 has 2 items");
    }
}
