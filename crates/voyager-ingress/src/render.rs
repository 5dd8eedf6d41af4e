//! HAProxy config renderer
//!
//! A plain walk over the [`RoutingModel`]; all ordering is settled by the
//! model builder. Identical models render byte-identical text.

use minijinja::{context, Environment, UndefinedBehavior};

use crate::compiler::{CompileError, ObjectKey};
use crate::model::{Backend, RoutingModel};

const TEMPLATE_NAME: &str = "haproxy.cfg";

/// HAProxy template loaded at compile time
const HAPROXY_TEMPLATE: &str = include_str!("../templates/haproxy.cfg.j2");

fn environment() -> Result<Environment<'static>, CompileError> {
    let mut env = Environment::new();
    env.set_trim_blocks(true);
    env.set_lstrip_blocks(true);
    env.set_keep_trailing_newline(true);
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.add_template(TEMPLATE_NAME, HAPROXY_TEMPLATE)
        .map_err(render_error)?;
    Ok(env)
}

/// Render `haproxy.cfg` for the Ingress identified by `ingress`
pub fn render(model: &RoutingModel, ingress: &ObjectKey) -> Result<String, CompileError> {
    let env = environment()?;
    let backends: Vec<&Backend> = model
        .default_backend
        .iter()
        .chain(model.backends.iter())
        .collect();
    env.get_template(TEMPLATE_NAME)
        .and_then(|t| {
            t.render(context! {
                ingress => ingress.to_string(),
                model => model,
                backends => backends,
            })
        })
        .map_err(render_error)
}

fn render_error(err: minijinja::Error) -> CompileError {
    CompileError::Render(err.to_string())
}
