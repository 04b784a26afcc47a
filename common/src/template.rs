use std::collections::HashMap;
use thiserror::Error;

/// A single step's recorded output, as exposed to later steps' templates.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Template rendering context: `spec.md` §4.2 exposes `Input` (the
/// pipeline-level input) and `Steps[name].Output`/`.Error`.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    pub input: Option<String>,
    pub steps: HashMap<String, StepOutput>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TemplateError {
    #[error("unclosed template expression")]
    Unclosed,
    #[error("unknown template expression: {0:?}")]
    Unknown(String),
    #[error("unknown step {0:?} referenced in template")]
    UnknownStep(String),
}

/// Renders a Go-template-equivalent task string. A string containing no
/// `{{` is passed through untouched (`spec.md` §9 "Template engine").
/// Supports `{{.Input}}` and `{{index .Steps "name" "Output"|"Error"}}`.
pub fn render(task: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
    if !task.contains("{{") {
        return Ok(task.to_string());
    }
    let mut out = String::with_capacity(task.len());
    let mut rest = task;
    loop {
        match rest.find("{{") {
            None => {
                out.push_str(rest);
                break;
            }
            Some(start) => {
                out.push_str(&rest[..start]);
                let after = &rest[start + 2..];
                let end = after.find("}}").ok_or(TemplateError::Unclosed)?;
                let expr = after[..end].trim();
                out.push_str(&eval_expr(expr, ctx)?);
                rest = &after[end + 2..];
            }
        }
    }
    Ok(out)
}

fn eval_expr(expr: &str, ctx: &TemplateContext) -> Result<String, TemplateError> {
    if expr == ".Input" {
        return Ok(ctx.input.clone().unwrap_or_default());
    }
    if let Some(rest) = expr.strip_prefix("index .Steps ") {
        let args = split_quoted_args(rest);
        if let [step, field] = args.as_slice() {
            let step_out = ctx
                .steps
                .get(step)
                .ok_or_else(|| TemplateError::UnknownStep(step.clone()))?;
            return match field.as_str() {
                "Output" => Ok(step_out.output.clone().unwrap_or_default()),
                "Error" => Ok(step_out.error.clone().unwrap_or_default()),
                _ => Err(TemplateError::Unknown(expr.to_string())),
            };
        }
    }
    Err(TemplateError::Unknown(expr.to_string()))
}

/// Splits `"a" "Output"` into `["a", "Output"]`.
fn split_quoted_args(s: &str) -> Vec<String> {
    s.split('"')
        .enumerate()
        .filter_map(|(i, chunk)| (i % 2 == 1).then(|| chunk.to_string()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passthrough_when_no_placeholders() {
        let ctx = TemplateContext::default();
        assert_eq!(render("plain task", &ctx).unwrap(), "plain task");
    }

    #[test]
    fn renders_input_and_step_output() {
        let mut ctx = TemplateContext {
            input: Some("seed".to_string()),
            steps: HashMap::new(),
        };
        ctx.steps.insert(
            "a".to_string(),
            StepOutput {
                output: Some("alpha".to_string()),
                error: None,
            },
        );
        let task = r#"consume: {{.Input}} / {{index .Steps "a" "Output"}}"#;
        assert_eq!(render(task, &ctx).unwrap(), "consume: seed / alpha");
    }

    #[test]
    fn missing_step_is_an_error() {
        let ctx = TemplateContext::default();
        let err = render(r#"{{index .Steps "ghost" "Output"}}"#, &ctx).unwrap_err();
        assert_eq!(err, TemplateError::UnknownStep("ghost".to_string()));
    }

    #[test]
    fn unclosed_expression_is_an_error() {
        let ctx = TemplateContext::default();
        assert_eq!(render("hi {{.Input", &ctx).unwrap_err(), TemplateError::Unclosed);
    }

    #[test]
    fn renders_step_error_field() {
        let mut ctx = TemplateContext::default();
        ctx.steps.insert(
            "a".to_string(),
            StepOutput {
                output: None,
                error: Some("boom".to_string()),
            },
        );
        let out = render(r#"{{index .Steps "a" "Error"}}"#, &ctx).unwrap();
        assert_eq!(out, "boom");
    }
}
