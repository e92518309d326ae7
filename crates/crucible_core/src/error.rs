use std::path::{Path, PathBuf};

use crucible_env::{EvalError, Frame};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Cannot find module '{request}' from '{from}'{hint}")]
    ModuleNotFound {
        request: String,
        from: String,
        hint: String,
    },
    #[error("transform of {path} failed: {message}")]
    Transform { path: PathBuf, message: String },
    #[error("could not derive mock metadata from {path}; its exports produced nothing to mirror. Provide a manual mock in a __mocks__ directory next to the module")]
    MockMetadata { path: PathBuf },
    #[error("isolation scopes cannot be nested")]
    NestedIsolation,
    #[error("configured extra global '{name}' is not defined on the sandbox global")]
    MissingExtraGlobal { name: String },
    #[error("resolve requires a non-empty request string")]
    EmptyResolveRequest,
    #[error("timer operation needs fake timers installed; switch with useFakeTimers first")]
    FakeTimersNotInstalled,
    #[error("unknown host built-in '{name}'")]
    UnknownCoreModule { name: String },
    #[error("invalid configuration: {message}")]
    InvalidConfig { message: String },
    #[error("transform store failure: {0}")]
    Store(String),
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl RuntimeError {
    pub fn module_not_found(from: &Path, request: &str) -> RuntimeError {
        RuntimeError::ModuleNotFound {
            request: request.to_string(),
            from: from.display().to_string(),
            hint: String::new(),
        }
    }
}

/// Attach a did-you-mean hint naming sibling files reachable by swapping the
/// configured extensions. Leaves other errors untouched.
pub fn enrich_not_found(
    error: RuntimeError,
    from: &Path,
    request: &str,
    extensions: &[String],
) -> RuntimeError {
    let RuntimeError::ModuleNotFound {
        request: req,
        from: from_display,
        ..
    } = &error
    else {
        return error;
    };

    if !request.starts_with('.') {
        return error;
    }
    let base = from
        .parent()
        .unwrap_or_else(|| Path::new("/"))
        .join(request);

    let mut candidates = Vec::new();
    for ext in extensions {
        let mut candidate = base.clone().into_os_string();
        candidate.push(".");
        candidate.push(ext);
        let candidate = PathBuf::from(candidate);
        if candidate.exists() {
            candidates.push(format!("{}.{}", request, ext));
        }
    }

    if candidates.is_empty() {
        return error;
    }
    RuntimeError::ModuleNotFound {
        request: req.clone(),
        from: from_display.clone(),
        hint: format!(" (did you mean '{}'?)", candidates.join("' or '")),
    }
}

/// Reference error logged (never thrown) when a module is loaded after the
/// sandbox was torn down.
pub fn teardown_reference_error(path: &Path, stack: &[Frame]) -> String {
    let mut message = format!(
        "ReferenceError: you are trying to load '{}' after the test environment has been torn down",
        path.display()
    );
    let rendered = render_stack(stack, |_| false);
    if !rendered.is_empty() {
        message.push('\n');
        message.push_str(&rendered);
    }
    message
}

/// Render a script stack innermost-first, dropping frames the predicate
/// marks as runtime-internal.
pub fn render_stack(stack: &[Frame], is_internal: impl Fn(&str) -> bool) -> String {
    stack
        .iter()
        .rev()
        .filter(|frame| !is_internal(&frame.file))
        .map(|frame| format!("    at {}:{}", frame.file, frame.line))
        .collect::<Vec<_>>()
        .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_enrich_suggests_sibling_extensions() {
        let mut dir = std::env::temp_dir();
        dir.push("crucible_error_tests");
        dir.push("suggest");
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("util.ts"), "export const x = 1;").unwrap();

        let from = dir.join("main.js");
        let error = RuntimeError::module_not_found(&from, "./util");
        let enriched = enrich_not_found(error, &from, "./util", &["ts".into(), "js".into()]);
        let message = enriched.to_string();
        assert!(message.contains("./util.ts"), "got: {}", message);
    }

    #[test]
    fn test_render_stack_filters_internal_frames() {
        let stack = vec![
            Frame {
                file: "/proj/test.js".into(),
                line: 3,
            },
            Frame {
                file: "/internal/bootstrap.js".into(),
                line: 10,
            },
        ];
        let rendered = render_stack(&stack, |file| file.starts_with("/internal/"));
        assert!(rendered.contains("/proj/test.js:3"));
        assert!(!rendered.contains("bootstrap"));
    }
}
