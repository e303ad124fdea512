//! Builder for fake analysis scripts.
//!
//! The generated text is a shell script that still looks enough like an
//! analysis script for the templating engine: `save "<path>" <layer>` lines
//! and `${LAYER_PATH:<name>}` placeholders are rewritten before the shell
//! sees them. A `save` shell function writes a small file at the rewritten
//! path, and the result document is printed from a quoted heredoc.

use serde_json::{json, Value};
use std::path::Path;

const RESULT_DELIMITER: &str = "VOXRUN_RESULT";

#[derive(Clone, Debug, Default)]
pub struct FakeAnalysis {
    body: Vec<String>,
    print: Vec<Value>,
    layers: Vec<Value>,
    log: String,
    error: String,
    exit_code: i32,
    raw_stdout: Option<String>,
}

impl FakeAnalysis {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Save `layer` to `path` (as written in the script) and report it.
    #[must_use]
    pub fn save(mut self, path: &str, layer: &str) -> Self {
        self.body.push(format!("save \"{path}\" {layer}"));
        self.layers.push(json!({ "name": layer, "vltype": "model" }));
        self
    }

    /// Fail with an analysis error unless the placeholder for `layer`
    /// resolves to an existing file.
    #[must_use]
    pub fn require_layer(mut self, layer: &str) -> Self {
        let missing = json!({ "error": format!("layer {layer} missing") }).to_string();
        self.body.push(format!(
            "test -f \"${{LAYER_PATH:{layer}}}\" || {{ printf '%s' {}; exit 0; }}",
            quote(&missing)
        ));
        self
    }

    #[must_use]
    pub fn print(mut self, name: &str, vltype: &str, value: Value) -> Self {
        self.print
            .push(json!({ "name": name, "vltype": vltype, "value": value }));
        self
    }

    #[must_use]
    pub fn log(mut self, log: &str) -> Self {
        self.log = log.to_string();
        self
    }

    /// Report `error` in the result document.
    #[must_use]
    pub fn error(mut self, error: &str) -> Self {
        self.error = error.to_string();
        self
    }

    #[must_use]
    pub fn stderr(mut self, text: &str) -> Self {
        self.body.push(format!("printf '%s\\n' {} >&2", quote(text)));
        self
    }

    #[must_use]
    pub fn exit_code(mut self, code: i32) -> Self {
        self.exit_code = code;
        self
    }

    /// Print `stdout` verbatim instead of a result document.
    #[must_use]
    pub fn stdout(mut self, stdout: &str) -> Self {
        self.raw_stdout = Some(stdout.to_string());
        self
    }

    /// Block for `secs` seconds before printing anything.
    #[must_use]
    pub fn sleep(mut self, secs: u32) -> Self {
        self.body.push(format!("sleep {secs}"));
        self
    }

    /// Block for `secs` seconds, only when running for `case_id`.
    ///
    /// The script path is `<workspace>/<case>/<run>/script.imgql`, so the
    /// case is recognised from `$0`.
    #[must_use]
    pub fn sleep_for_case(mut self, case_id: &str, secs: u32) -> Self {
        self.body
            .push(format!("case \"$0\" in */{case_id}/*) sleep {secs};; esac"));
        self
    }

    /// Start a background `sleep` and wait on it, recording
    /// `<shell pid> <sleep pid>` in `pidfile` first.
    #[must_use]
    pub fn hang_with_child(mut self, secs: u32, pidfile: &Path) -> Self {
        self.body.push(hang_line(secs, pidfile));
        self
    }

    /// [`hang_with_child`](Self::hang_with_child), only when running for
    /// `case_id`.
    #[must_use]
    pub fn hang_case_with_child(mut self, case_id: &str, secs: u32, pidfile: &Path) -> Self {
        self.body.push(format!(
            "case \"$0\" in */{case_id}/*) {};; esac",
            hang_line(secs, pidfile)
        ));
        self
    }

    /// Report `error` and exit cleanly, only when running for `case_id`.
    #[must_use]
    pub fn fail_case(mut self, case_id: &str, error: &str) -> Self {
        let document = json!({ "print": [], "layers": [], "log": "", "error": error });
        self.body.push(format!(
            "case \"$0\" in */{case_id}/*) printf '%s' {}; exit 0;; esac",
            quote(&document.to_string())
        ));
        self
    }

    /// The result document the script prints.
    pub fn document(&self) -> Value {
        json!({
            "print": self.print,
            "layers": self.layers,
            "log": self.log,
            "error": self.error,
        })
    }

    /// Render the script text submitted as `scriptContent`.
    pub fn script(&self) -> String {
        let mut lines = vec![
            "#!/bin/sh".to_string(),
            "save() { printf 'voxels' > \"$1\"; }".to_string(),
        ];
        lines.extend(self.body.iter().cloned());
        let stdout = self
            .raw_stdout
            .clone()
            .unwrap_or_else(|| self.document().to_string());
        lines.push(format!("cat <<'{RESULT_DELIMITER}'"));
        lines.push(stdout);
        lines.push(RESULT_DELIMITER.to_string());
        lines.push(format!("exit {}", self.exit_code));
        let mut script = lines.join("\n");
        script.push('\n');
        script
    }
}

fn hang_line(secs: u32, pidfile: &Path) -> String {
    let pidfile = quote(&pidfile.display().to_string());
    format!("sleep {secs} & printf '%s %s\\n' \"$$\" \"$!\" > {pidfile}; wait")
}

/// Single-quote `text` for the shell.
fn quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', r"'\''"))
}
