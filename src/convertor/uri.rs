//! Path template rendering.
//!
//! Resource paths may contain stage variables (`{env.NAME}`), which are
//! substituted from the stage, and path parameters (`{name}` or `:name`),
//! which are kept as data-plane parameters (`:name`).

use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

use crate::core::error::{ReleaseError, ReleaseResult};

/// Name of the wildcard parameter capturing the sub-path of a subpath-matching route
pub const SUBPATH_PARAM_NAME: &str = "bk_api_subpath_match_param_name";

/// Base priority of subpath-matching routes; exact routes have priority 0
pub const SUBPATH_PRIORITY_PENALTY: i32 = -1000;

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| Regex::new(r"\{([^{}]*)\}").expect("placeholder regex is valid"))
}

/// Which syntax path parameters are rendered with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamStyle {
    /// `:name`, the data-plane route syntax
    Colon,
    /// `{name}`, kept for upstream rewrite templates
    Braces,
}

/// A path with stage variables substituted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedPath {
    /// Always starts with `/`
    pub path: String,
    pub has_params: bool,
}

impl RenderedPath {
    /// Path without trailing slashes; empty for the root path
    pub fn trimmed(&self) -> &str {
        self.path.trim_end_matches('/')
    }

    /// Number of characters outside path parameter tokens
    pub fn literal_len(&self) -> usize {
        self.path
            .split('/')
            .filter(|segment| !segment.starts_with(':'))
            .map(|segment| segment.chars().count())
            .sum::<usize>()
            + self.path.matches('/').count()
    }
}

/// Substitute `{env.NAME}` from `vars` and render parameters in `style`
pub fn render_path(
    template: &str,
    vars: &BTreeMap<String, String>,
    style: ParamStyle,
) -> ReleaseResult<RenderedPath> {
    let mut rendered = String::with_capacity(template.len() + 1);
    if !template.starts_with('/') {
        rendered.push('/');
    }

    let mut has_params = false;
    let mut last = 0;
    for captures in placeholder_regex().captures_iter(template) {
        let (Some(whole), Some(name)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        let name = name.as_str().trim();
        rendered.push_str(&template[last..whole.start()]);
        last = whole.end();

        if let Some(var) = name.strip_prefix("env.") {
            let value = vars.get(var).ok_or_else(|| ReleaseError::InvalidPath {
                path: template.to_string(),
                reason: format!("stage variable {} is not defined", var),
            })?;
            rendered.push_str(value);
            continue;
        }

        if name.is_empty() {
            return Err(ReleaseError::InvalidPath {
                path: template.to_string(),
                reason: "empty path parameter".to_string(),
            });
        }

        has_params = true;
        match style {
            ParamStyle::Colon => {
                rendered.push(':');
                rendered.push_str(name);
            }
            ParamStyle::Braces => {
                rendered.push('{');
                rendered.push_str(name);
                rendered.push('}');
            }
        }
    }
    rendered.push_str(&template[last..]);

    if rendered.split('/').any(|segment| segment.starts_with(':')) {
        has_params = true;
    }

    Ok(RenderedPath {
        path: rendered,
        has_params,
    })
}

/// Route uris for a rendered resource path under `stage_prefix`
///
/// A concrete path yields a bare and a trailing-slash form; a path with
/// parameters yields one form whose `/?` suffix marks the trailing slash as
/// optional. Subpath matching adds a wildcard uri.
pub fn build_uris(stage_prefix: &str, path: &RenderedPath, match_subpath: bool) -> Vec<String> {
    let base = format!("{}{}", stage_prefix, path.trimmed());

    let mut uris = if path.has_params {
        vec![format!("{}/?", base)]
    } else {
        vec![base.clone(), format!("{}/", base)]
    };

    if match_subpath {
        uris.push(format!("{}/*{}", base, SUBPATH_PARAM_NAME));
    }

    uris
}

/// Match priority of a route
///
/// Subpath routes sit below every exact route; among them, longer literal
/// prefixes win.
pub fn route_priority(path: &RenderedPath, match_subpath: bool) -> i32 {
    if !match_subpath {
        return 0;
    }
    let bonus = path.literal_len().min((-SUBPATH_PRIORITY_PENALTY - 1) as usize) as i32;
    SUBPATH_PRIORITY_PENALTY + bonus
}
