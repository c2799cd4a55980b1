//! Sandbox controller: decides once per render whether user code runs under
//! the security policy, and installs that policy around a single evaluation.
//!
//! Two layers are active when security is enabled:
//! - a source transformation that routes restricted identifiers through
//!   `__emailext__.check(..)`, which consults the registered policy
//! - a runtime interceptor: the policy is stored in the runtime's op state
//!   and restricted globals are replaced with throwing accessors
//!
//! Registration is scoped to a [`SandboxRegistration`] guard and undone when
//! it drops, on every exit path. The policy belongs to one runtime, so
//! renders on other runtimes are never affected.

use crate::binding::ExecutionContext;
use crate::error::SandboxError;
use deno_core::JsRuntime;
use std::collections::BTreeSet;
use std::ops::{Deref, DerefMut};

/// Convenience namespaces published unqualified in every environment.
/// Not a security boundary.
pub const DEFAULT_IMPORTS: &[&str] = &["text", "time"];

/// Identifiers user scripts may not touch while the policy is registered.
pub const DENIED_IDENTIFIERS: &[&str] = &[
    "eval",
    "Function",
    "Deno",
    "WebAssembly",
    "globalThis",
    "import",
    "__bootstrap",
    "__infra",
];

/// The set of operations denied to sandboxed scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxPolicy {
    denied: BTreeSet<String>,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            denied: DENIED_IDENTIFIERS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl SandboxPolicy {
    pub fn permits(&self, name: &str) -> bool {
        !self.denied.contains(name)
    }

    pub fn denied(&self) -> impl Iterator<Item = &str> {
        self.denied.iter().map(String::as_str)
    }
}

/// Rewrites restricted identifiers into policy-checked lookups.
///
/// String literals, comments, template text, property names after `.`,
/// object-literal keys and method or class member names are left alone.
/// Regular expression literals are not recognised.
#[derive(Debug, Clone)]
pub struct SandboxTransformer {
    policy: SandboxPolicy,
}

impl SandboxTransformer {
    pub fn new(policy: SandboxPolicy) -> Self {
        Self { policy }
    }

    pub fn transform(&self, source: &str) -> String {
        let chars: Vec<char> = source.chars().collect();
        let mut out = String::with_capacity(source.len() + 64);
        // Brace depths at which an open `${` of a template literal resumes.
        let mut templates: Vec<usize> = Vec::new();
        let mut depth = 0usize;
        // One entry per open brace: whether it opened a class body.
        let mut blocks: Vec<bool> = Vec::new();
        let mut class_pending = false;
        let mut i = 0;

        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();
            match c {
                '/' if next == Some('/') => {
                    let end = find_from(&chars, i, |c| c == '\n').unwrap_or(chars.len());
                    push_range(&mut out, &chars, i, end);
                    i = end;
                }
                '/' if next == Some('*') => {
                    let end = find_pair(&chars, i + 2, '*', '/')
                        .map(|e| e + 2)
                        .unwrap_or(chars.len());
                    push_range(&mut out, &chars, i, end);
                    i = end;
                }
                '\'' | '"' => {
                    let end = skip_string(&chars, i);
                    push_range(&mut out, &chars, i, end);
                    i = end;
                }
                '`' => {
                    out.push('`');
                    let (end, opened) = scan_template(&chars, i + 1, &mut out);
                    if opened {
                        templates.push(depth);
                    }
                    i = end;
                }
                '{' => {
                    depth += 1;
                    blocks.push(std::mem::take(&mut class_pending));
                    out.push(c);
                    i += 1;
                }
                '}' if templates.last() == Some(&depth) => {
                    templates.pop();
                    out.push('}');
                    let (end, opened) = scan_template(&chars, i + 1, &mut out);
                    if opened {
                        templates.push(depth);
                    }
                    i = end;
                }
                '}' => {
                    depth = depth.saturating_sub(1);
                    blocks.pop();
                    out.push(c);
                    i += 1;
                }
                c if c.is_ascii_digit() => {
                    let end = find_from(&chars, i, |c| !(c.is_alphanumeric() || c == '_' || c == '.'))
                        .unwrap_or(chars.len());
                    push_range(&mut out, &chars, i, end);
                    i = end;
                }
                c if is_ident_start(c) => {
                    let end = find_from(&chars, i, |c| !is_ident_part(c)).unwrap_or(chars.len());
                    let ident: String = chars[i..end].iter().collect();
                    let in_class_body = blocks.last() == Some(&true);
                    if ident == "class" && !is_property_access(&out) {
                        class_pending = true;
                    }
                    if self.should_rewrite(&ident, &out, &chars, end, in_class_body) {
                        out.push_str(&format!("__emailext__.check(\"{}\")", ident));
                    } else {
                        out.push_str(&ident);
                    }
                    i = end;
                }
                _ => {
                    out.push(c);
                    i += 1;
                }
            }
        }

        out
    }

    fn should_rewrite(
        &self,
        ident: &str,
        out: &str,
        chars: &[char],
        end: usize,
        in_class_body: bool,
    ) -> bool {
        if self.policy.permits(ident) || is_property_access(out) {
            return false;
        }
        if ident == "import" {
            return next_significant(chars, end).map(|j| chars[j]) == Some('(');
        }
        !is_member_name(out, chars, end, in_class_body)
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

fn is_ident_part(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '$'
}

/// Preceded by `.` (but not a `...` spread).
fn is_property_access(out: &str) -> bool {
    let trimmed = out.trim_end();
    trimmed.ends_with('.') && !trimmed.ends_with("...")
}

/// Object-literal key, method shorthand or class member name.
fn is_member_name(out: &str, chars: &[char], end: usize, in_class_body: bool) -> bool {
    let prev = out.trim_end();
    let next = next_significant(chars, end);
    let next_char = next.map(|j| chars[j]);

    if prev.ends_with(['{', ',']) && next_char == Some(':') {
        return true;
    }

    let member_start = prev.ends_with(['{', ',', ';', '}', '*'])
        || ["static", "get", "set", "async"]
            .iter()
            .any(|word| ends_with_word(prev, word));
    if !member_start {
        return false;
    }
    if in_class_body {
        return true;
    }
    match next {
        Some(open) if chars[open] == '(' => body_follows(chars, open),
        _ => false,
    }
}

fn ends_with_word(text: &str, word: &str) -> bool {
    text.strip_suffix(word)
        .is_some_and(|rest| !rest.chars().last().is_some_and(is_ident_part))
}

fn next_significant(chars: &[char], start: usize) -> Option<usize> {
    find_from(chars, start, |c| !c.is_whitespace())
}

/// Whether the parameter list opened at `open` is followed by a `{` body.
fn body_follows(chars: &[char], open: usize) -> bool {
    let mut depth = 0usize;
    let mut j = open;
    while j < chars.len() {
        match chars[j] {
            '\'' | '"' | '`' => {
                j = skip_quoted(chars, j);
                continue;
            }
            '(' => depth += 1,
            ')' => {
                depth -= 1;
                if depth == 0 {
                    return next_significant(chars, j + 1).map(|k| chars[k]) == Some('{');
                }
            }
            _ => {}
        }
        j += 1;
    }
    false
}

/// End (exclusive) of a quoted literal, template literals included, without
/// looking inside substitutions.
fn skip_quoted(chars: &[char], start: usize) -> usize {
    if chars[start] != '`' {
        return skip_string(chars, start);
    }
    let mut j = start + 1;
    while j < chars.len() {
        match chars[j] {
            '\\' => j += 2,
            '`' => return j + 1,
            _ => j += 1,
        }
    }
    chars.len()
}

fn find_from(chars: &[char], start: usize, pred: impl Fn(char) -> bool) -> Option<usize> {
    chars[start..].iter().position(|&c| pred(c)).map(|p| p + start)
}

fn find_pair(chars: &[char], start: usize, a: char, b: char) -> Option<usize> {
    (start..chars.len().saturating_sub(1)).find(|&j| chars[j] == a && chars[j + 1] == b)
}

fn push_range(out: &mut String, chars: &[char], start: usize, end: usize) {
    out.extend(&chars[start..end]);
}

/// End (exclusive) of the quoted string starting at `start`.
fn skip_string(chars: &[char], start: usize) -> usize {
    let quote = chars[start];
    let mut j = start + 1;
    while j < chars.len() {
        match chars[j] {
            '\\' => j += 2,
            '\n' => return j,
            c if c == quote => return j + 1,
            _ => j += 1,
        }
    }
    chars.len()
}

/// Copy template text from `start`. Returns the resume index and whether a
/// `${` substitution was opened (true) or the literal closed (false).
fn scan_template(chars: &[char], start: usize, out: &mut String) -> (usize, bool) {
    let mut j = start;
    while j < chars.len() {
        match chars[j] {
            '\\' => {
                let end = (j + 2).min(chars.len());
                push_range(out, chars, j, end);
                j = end;
            }
            '`' => {
                out.push('`');
                return (j + 1, false);
            }
            '$' if chars.get(j + 1) == Some(&'{') => {
                out.push_str("${");
                return (j + 2, true);
            }
            c => {
                out.push(c);
                j += 1;
            }
        }
    }
    (j, false)
}

/// Execution environment for one render, fixed once configured.
#[derive(Debug, Clone)]
pub struct ExecutionEnvironment {
    imports: &'static [&'static str],
    policy: Option<SandboxPolicy>,
}

impl ExecutionEnvironment {
    /// Read the security decision once; it holds for the whole render.
    pub fn configure(security_enabled: bool) -> Self {
        Self {
            imports: DEFAULT_IMPORTS,
            policy: security_enabled.then(SandboxPolicy::default),
        }
    }

    pub fn is_sandboxed(&self) -> bool {
        self.policy.is_some()
    }

    pub fn imports(&self) -> &[&'static str] {
        self.imports
    }

    /// Prepare `runtime` for evaluation: publish the convenience imports,
    /// bind the context, and confirm the policy hooks exist when sandboxed.
    pub fn prepare(
        &self,
        runtime: &mut JsRuntime,
        context: &ExecutionContext,
    ) -> Result<(), SandboxError> {
        if self.is_sandboxed() {
            let probe = runtime
                .execute_script(
                    "[sandbox-probe]",
                    "typeof globalThis.__emailext__?.sandbox?.install === 'function'".to_string(),
                )
                .map_err(SandboxError::Bootstrap)?;
            let available = {
                let scope = &mut runtime.handle_scope();
                deno_core::v8::Local::new(scope, &probe).is_true()
            };
            if !available {
                return Err(SandboxError::Unavailable);
            }
        }

        let imports = serde_json::to_string(self.imports)
            .map_err(|e| SandboxError::Bootstrap(e.into()))?;
        let payload = serde_json::to_string(&context.to_payload())
            .map_err(|e| SandboxError::Bootstrap(e.into()))?;
        runtime
            .execute_script(
                "[bind]",
                format!(
                    "__emailext__.importNamespaces({}); __emailext__.bind({});",
                    imports, payload
                ),
            )
            .map_err(SandboxError::Bootstrap)?;
        Ok(())
    }

    /// Source as it will be compiled in this environment.
    pub fn compile_source(&self, source: &str) -> String {
        match &self.policy {
            Some(policy) => SandboxTransformer::new(policy.clone()).transform(source),
            None => source.to_string(),
        }
    }

    /// Register the runtime interceptor for the duration of the returned
    /// guard. A no-op guard when not sandboxed.
    pub fn register<'rt>(
        &self,
        runtime: &'rt mut JsRuntime,
    ) -> Result<SandboxRegistration<'rt>, SandboxError> {
        let Some(policy) = &self.policy else {
            return Ok(SandboxRegistration {
                runtime,
                token: None,
            });
        };

        let token = uuid::Uuid::new_v4().to_string();
        let denied: Vec<&str> = policy.denied().collect();
        let denied = serde_json::to_string(&denied).map_err(|e| SandboxError::Register(e.into()))?;

        runtime.op_state().borrow_mut().put(policy.clone());
        if let Err(e) = runtime.execute_script(
            "[sandbox-register]",
            format!("__emailext__.sandbox.install({:?}, {})", token, denied),
        ) {
            runtime.op_state().borrow_mut().try_take::<SandboxPolicy>();
            return Err(SandboxError::Register(e));
        }

        tracing::debug!("Sandbox policy registered");
        Ok(SandboxRegistration {
            runtime,
            token: Some(token),
        })
    }
}

/// Keeps the sandbox policy registered on a runtime. Dereferences to the
/// runtime so evaluation happens through the guard.
pub struct SandboxRegistration<'rt> {
    runtime: &'rt mut JsRuntime,
    token: Option<String>,
}

impl SandboxRegistration<'_> {
    pub fn is_active(&self) -> bool {
        self.token.is_some()
    }
}

impl Deref for SandboxRegistration<'_> {
    type Target = JsRuntime;

    fn deref(&self) -> &JsRuntime {
        &*self.runtime
    }
}

impl DerefMut for SandboxRegistration<'_> {
    fn deref_mut(&mut self) -> &mut JsRuntime {
        &mut *self.runtime
    }
}

impl Drop for SandboxRegistration<'_> {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };

        self.runtime.op_state().borrow_mut().try_take::<SandboxPolicy>();
        if let Err(e) = self.runtime.execute_script(
            "[sandbox-unregister]",
            format!("__emailext__.sandbox.uninstall({:?})", token),
        ) {
            tracing::error!("Failed to unregister sandbox interceptor: {}", e);
        } else {
            tracing::debug!("Sandbox policy unregistered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transform(source: &str) -> String {
        SandboxTransformer::new(SandboxPolicy::default()).transform(source)
    }

    #[test]
    fn test_policy_denies_defaults() {
        let policy = SandboxPolicy::default();
        assert!(!policy.permits("eval"));
        assert!(!policy.permits("Function"));
        assert!(!policy.permits("__bootstrap"));
        assert!(policy.permits("Math"));
    }

    #[test]
    fn test_rewrites_restricted_identifiers() {
        assert_eq!(
            transform("eval('1 + 1')"),
            "__emailext__.check(\"eval\")('1 + 1')"
        );
        assert_eq!(
            transform("new Function('return 1')()"),
            "new __emailext__.check(\"Function\")('return 1')()"
        );
        assert_eq!(
            transform("Deno.core"),
            "__emailext__.check(\"Deno\").core"
        );
    }

    #[test]
    fn test_leaves_strings_comments_and_properties() {
        let source = "// eval here\n/* Function */ var s = 'eval' + \"Deno\"; obj.eval(1); obj. Function;";
        assert_eq!(transform(source), source);

        for source in [
            "var o = { eval: 1 }",
            "var o = { a: 1, Function : 2 }",
            "var o = { eval() { return 1; } }",
            "var o = { async eval(a, b) { return a; }, get Deno() { return 2; } }",
            "class K { Function() { return 1; } }",
            "class K { static eval(x) { return x; } Deno = 1; }",
            "class K extends Base { m() { return 1; } eval() {} }",
        ] {
            assert_eq!(transform(source), source);
        }
    }

    #[test]
    fn test_calls_next_to_members_are_rewritten() {
        assert_eq!(
            transform("f(1, eval('x'))"),
            "f(1, __emailext__.check(\"eval\")('x'))"
        );
        assert_eq!(
            transform("{ eval('x') }"),
            "{ __emailext__.check(\"eval\")('x') }"
        );
        assert_eq!(
            transform("var o = { a: eval }"),
            "var o = { a: __emailext__.check(\"eval\") }"
        );
        assert_eq!(
            transform("class K { m() { return eval('1'); } }"),
            "class K { m() { return __emailext__.check(\"eval\")('1'); } }"
        );
        assert_eq!(
            transform("class K { x = Function; }"),
            "class K { x = __emailext__.check(\"Function\"); }"
        );
    }

    #[test]
    fn test_rewrites_engine_bootstrap_globals() {
        assert_eq!(
            transform("__bootstrap.primordials.Function('return 1')()"),
            "__emailext__.check(\"__bootstrap\").primordials.Function('return 1')()"
        );
        assert_eq!(
            transform("__bootstrap.core.evalContext('1')"),
            "__emailext__.check(\"__bootstrap\").core.evalContext('1')"
        );
    }

    #[test]
    fn test_only_dynamic_import_is_rewritten() {
        assert_eq!(
            transform("import ('./x.js')"),
            "__emailext__.check(\"import\") ('./x.js')"
        );
        assert_eq!(transform("var important = 1;"), "var important = 1;");
    }

    #[test]
    fn test_template_literals() {
        assert_eq!(transform("`eval ${x}`"), "`eval ${x}`");
        assert_eq!(
            transform("`a ${eval('1')} b ${ {k: 1}.k } eval`"),
            "`a ${__emailext__.check(\"eval\")('1')} b ${ {k: 1}.k } eval`"
        );
    }

    #[test]
    fn test_identifier_boundaries() {
        assert_eq!(transform("evaluate(1); $eval; eval_x"), "evaluate(1); $eval; eval_x");
        assert_eq!(transform("f(...eval)"), "f(...__emailext__.check(\"eval\"))");
        assert_eq!(transform("0x1e5 + 2eval"), "0x1e5 + 2eval");
    }

    #[test]
    fn test_unterminated_literals_are_copied() {
        assert_eq!(transform("'abc"), "'abc");
        assert_eq!(transform("/* open"), "/* open");
        assert_eq!(transform("`open ${"), "`open ${");
    }

    #[tokio::test]
    async fn test_registration_is_scoped_to_guard() {
        let resolver = crate::resolver::Resolver::new(std::env::temp_dir().join("script-content-sandbox-tests"));
        let mut runtime = crate::runtime::create_runtime(None, resolver).unwrap();
        let env = ExecutionEnvironment::configure(true);
        let context = ExecutionContext::build(
            &crate::binding::ScriptRequest::default(),
            &crate::binding::JsonBuild::default(),
            &crate::binding::JsonPublisher::default(),
            &crate::config::RendererConfig::default(),
        );
        env.prepare(&mut runtime, &context).unwrap();

        let is_registered = |runtime: &mut JsRuntime| {
            let value = runtime
                .execute_script("[test]", "__emailext__.sandbox.isRegistered()".to_string())
                .unwrap();
            let scope = &mut runtime.handle_scope();
            deno_core::v8::Local::new(scope, &value).is_true()
        };

        assert!(!is_registered(&mut runtime));
        {
            let mut registration = env.register(&mut runtime).unwrap();
            assert!(registration.is_active());
            assert!(is_registered(&mut *registration));
            let escaped = registration.execute_script(
                "[test]",
                "__bootstrap.primordials.Function('return 6*7')()".to_string(),
            );
            assert!(escaped.is_err());
        }
        assert!(!is_registered(&mut runtime));
    }

    #[test]
    fn test_environment_toggle() {
        let open = ExecutionEnvironment::configure(false);
        assert!(!open.is_sandboxed());
        assert_eq!(open.compile_source("eval('1')"), "eval('1')");
        assert_eq!(open.imports(), DEFAULT_IMPORTS);

        let sandboxed = ExecutionEnvironment::configure(true);
        assert!(sandboxed.is_sandboxed());
        assert_ne!(sandboxed.compile_source("eval('1')"), "eval('1')");
    }
}
