//! Typed `${{ }}` bindings
//!
//! Expressions are parsed once, when the job graph is built, into
//! [`Template`]s made of literal text and [`ContextRef`]s. Nothing is
//! interpolated from the process environment: every value a step sees was
//! bound explicitly and checked before the run started.
//!
//! Supported references:
//! - `${{ github.sha }}`, `github.ref`, `github.ref_name`, `github.actor`, ...
//! - `${{ env.VAR_NAME }}`
//! - `${{ secrets.SECRET_NAME }}`
//! - `${{ steps.step_id.outputs.output_name }}`
//! - `${{ needs.job_id.outputs.output_name }}`
//! - `${{ inputs.name }}` (reusable action definitions only)

use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

static EXPRESSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$\{\{([^}]*)\}\}").expect("valid expression regex"));

/// Errors that can occur while parsing expressions
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ExpressionError {
    #[error("Unknown context '{0}'")]
    UnknownContext(String),

    #[error("Unknown variable: {0}")]
    UnknownVariable(String),

    #[error("Invalid expression syntax: {0}")]
    InvalidSyntax(String),
}

/// Fields readable through `github.*`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GithubField {
    Sha,
    Ref,
    RefName,
    Actor,
    EventName,
    RunId,
    Repository,
    Workflow,
}

impl GithubField {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha" => Some(Self::Sha),
            "ref" => Some(Self::Ref),
            "ref_name" => Some(Self::RefName),
            "actor" => Some(Self::Actor),
            "event_name" => Some(Self::EventName),
            "run_id" => Some(Self::RunId),
            "repository" => Some(Self::Repository),
            "workflow" => Some(Self::Workflow),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sha => "sha",
            Self::Ref => "ref",
            Self::RefName => "ref_name",
            Self::Actor => "actor",
            Self::EventName => "event_name",
            Self::RunId => "run_id",
            Self::Repository => "repository",
            Self::Workflow => "workflow",
        }
    }
}

/// A single typed reference into the run context
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContextRef {
    Github(GithubField),
    Env(String),
    Secret(String),
    StepOutput { step: String, output: String },
    NeedsOutput { job: String, output: String },
    Input(String),
}

impl ContextRef {
    /// Parse a dotted reference (without the `${{ }}` wrapper)
    pub fn parse(expr: &str) -> Result<Self, ExpressionError> {
        let expr = expr.trim();
        let parts: Vec<&str> = expr.split('.').collect();

        if parts.iter().any(|p| !is_identifier(p)) {
            return Err(ExpressionError::InvalidSyntax(expr.to_string()));
        }

        match parts[0] {
            "github" => {
                if parts.len() != 2 {
                    return Err(ExpressionError::InvalidSyntax(format!(
                        "github expressions must be github.FIELD, got: {}",
                        expr
                    )));
                }
                GithubField::from_name(parts[1])
                    .map(ContextRef::Github)
                    .ok_or_else(|| ExpressionError::UnknownVariable(expr.to_string()))
            }

            "env" | "secrets" | "inputs" => {
                if parts.len() != 2 {
                    return Err(ExpressionError::InvalidSyntax(format!(
                        "{} expressions must be {}.NAME, got: {}",
                        parts[0], parts[0], expr
                    )));
                }
                let name = parts[1].to_string();
                Ok(match parts[0] {
                    "env" => ContextRef::Env(name),
                    "secrets" => ContextRef::Secret(name),
                    _ => ContextRef::Input(name),
                })
            }

            "steps" | "needs" => {
                if parts.len() != 4 || parts[2] != "outputs" {
                    return Err(ExpressionError::InvalidSyntax(format!(
                        "{} expressions must be {}.ID.outputs.NAME, got: {}",
                        parts[0], parts[0], expr
                    )));
                }
                let (id, output) = (parts[1].to_string(), parts[3].to_string());
                Ok(if parts[0] == "steps" {
                    ContextRef::StepOutput { step: id, output }
                } else {
                    ContextRef::NeedsOutput { job: id, output }
                })
            }

            other => Err(ExpressionError::UnknownContext(other.to_string())),
        }
    }
}

fn is_identifier(part: &str) -> bool {
    !part.is_empty()
        && part
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

impl fmt::Display for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContextRef::Github(field) => write!(f, "github.{}", field.as_str()),
            ContextRef::Env(name) => write!(f, "env.{}", name),
            ContextRef::Secret(name) => write!(f, "secrets.{}", name),
            ContextRef::StepOutput { step, output } => {
                write!(f, "steps.{}.outputs.{}", step, output)
            }
            ContextRef::NeedsOutput { job, output } => {
                write!(f, "needs.{}.outputs.{}", job, output)
            }
            ContextRef::Input(name) => write!(f, "inputs.{}", name),
        }
    }
}

/// Something that can produce values for references at run time
pub trait ValueSource {
    type Error;

    fn value_of(&mut self, reference: &ContextRef) -> Result<String, Self::Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Ref(ContextRef),
}

/// A string with typed `${{ }}` holes
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    /// Parse all expressions in a string
    pub fn parse(input: &str) -> Result<Self, ExpressionError> {
        let mut segments = Vec::new();
        let mut last = 0;

        for cap in EXPRESSION_REGEX.captures_iter(input) {
            let Some(full) = cap.get(0) else { continue };
            let expr = cap.get(1).map(|m| m.as_str()).unwrap_or_default();

            if full.start() > last {
                segments.push(Segment::Literal(input[last..full.start()].to_string()));
            }
            segments.push(Segment::Ref(ContextRef::parse(expr)?));
            last = full.end();
        }

        if last < input.len() {
            segments.push(Segment::Literal(input[last..].to_string()));
        }

        let unterminated = segments.iter().any(|s| match s {
            Segment::Literal(text) => text.contains("${{"),
            Segment::Ref(_) => false,
        });
        if unterminated {
            return Err(ExpressionError::InvalidSyntax(format!(
                "unterminated expression in: {}",
                input
            )));
        }

        Ok(Self { segments })
    }

    /// A template with no references
    pub fn literal(text: impl Into<String>) -> Self {
        Self {
            segments: vec![Segment::Literal(text.into())],
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// All references in this template
    pub fn refs(&self) -> impl Iterator<Item = &ContextRef> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Ref(r) => Some(r),
            Segment::Literal(_) => None,
        })
    }

    /// Produce the final string
    pub fn render<S: ValueSource + ?Sized>(&self, source: &mut S) -> Result<String, S::Error> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Ref(reference) => out.push_str(&source.value_of(reference)?),
            }
        }
        Ok(out)
    }

    /// Replace `inputs.*` references with bound input templates.
    ///
    /// Returns the name of the first input with no binding.
    pub fn substitute_inputs(&self, inputs: &BTreeMap<String, Template>) -> Result<Self, String> {
        let mut segments = Vec::new();
        for segment in &self.segments {
            match segment {
                Segment::Ref(ContextRef::Input(name)) => {
                    let bound = inputs.get(name).ok_or_else(|| name.clone())?;
                    segments.extend(bound.segments.iter().cloned());
                }
                other => segments.push(other.clone()),
            }
        }
        Ok(Self { segments })
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => f.write_str(text)?,
                Segment::Ref(reference) => write!(f, "${{{{ {} }}}}", reference)?,
            }
        }
        Ok(())
    }
}

/// Operand of a condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Ref(ContextRef),
    Literal(String),
}

impl Operand {
    fn parse(text: &str) -> Result<Self, ExpressionError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ExpressionError::InvalidSyntax("empty operand".to_string()));
        }

        for quote in ['\'', '"'] {
            if text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote) {
                return Ok(Operand::Literal(text[1..text.len() - 1].to_string()));
            }
        }

        if matches!(text, "true" | "false" | "null") || text.parse::<f64>().is_ok() {
            return Ok(Operand::Literal(text.to_string()));
        }

        ContextRef::parse(text).map(Operand::Ref)
    }

    fn value<S: ValueSource + ?Sized>(&self, source: &mut S) -> Result<String, S::Error> {
        match self {
            Operand::Ref(reference) => source.value_of(reference),
            Operand::Literal(text) => Ok(text.clone()),
        }
    }

    fn reference(&self) -> Option<&ContextRef> {
        match self {
            Operand::Ref(r) => Some(r),
            Operand::Literal(_) => None,
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::Ref(r) => write!(f, "{}", r),
            Operand::Literal(text) => write!(f, "'{}'", text),
        }
    }
}

/// A parsed `if:` condition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// `success()`: all dependencies succeeded, which the scheduler guarantees
    Success,
    Truthy(Operand),
    Equals(Operand, Operand),
    NotEquals(Operand, Operand),
}

impl Condition {
    /// Parse a condition; `${{ }}` wrappers are optional
    pub fn parse(input: &str) -> Result<Self, ExpressionError> {
        let unwrapped = EXPRESSION_REGEX.replace_all(input, "$1");
        let text = unwrapped.trim();

        if text.is_empty() {
            return Err(ExpressionError::InvalidSyntax("empty condition".to_string()));
        }
        if text == "success()" {
            return Ok(Condition::Success);
        }

        match find_operator(text) {
            Some((at, "!=")) => Ok(Condition::NotEquals(
                Operand::parse(&text[..at])?,
                Operand::parse(&text[at + 2..])?,
            )),
            Some((at, _)) => Ok(Condition::Equals(
                Operand::parse(&text[..at])?,
                Operand::parse(&text[at + 2..])?,
            )),
            None => Ok(Condition::Truthy(Operand::parse(text)?)),
        }
    }

    /// All references read by this condition
    pub fn refs(&self) -> Vec<&ContextRef> {
        match self {
            Condition::Success => vec![],
            Condition::Truthy(op) => op.reference().into_iter().collect(),
            Condition::Equals(l, r) | Condition::NotEquals(l, r) => {
                l.reference().into_iter().chain(r.reference()).collect()
            }
        }
    }

    pub fn evaluate<S: ValueSource + ?Sized>(&self, source: &mut S) -> Result<bool, S::Error> {
        match self {
            Condition::Success => Ok(true),
            Condition::Truthy(op) => Ok(is_truthy(&op.value(source)?)),
            Condition::Equals(l, r) => Ok(l.value(source)? == r.value(source)?),
            Condition::NotEquals(l, r) => Ok(l.value(source)? != r.value(source)?),
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Success => f.write_str("success()"),
            Condition::Truthy(op) => write!(f, "{}", op),
            Condition::Equals(l, r) => write!(f, "{} == {}", l, r),
            Condition::NotEquals(l, r) => write!(f, "{} != {}", l, r),
        }
    }
}

/// First `==` or `!=` outside a quoted literal, with its byte offset
fn find_operator(text: &str) -> Option<(usize, &'static str)> {
    let mut quote: Option<char> = None;
    let mut chars = text.char_indices().peekable();
    while let Some((at, c)) = chars.next() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if (c == '=' || c == '!') && chars.peek().map(|&(_, n)| n) == Some('=') => {
                return Some((at, if c == '!' { "!=" } else { "==" }));
            }
            None => {}
        }
    }
    None
}

fn is_truthy(value: &str) -> bool {
    !value.is_empty()
        && value != "false"
        && value != "0"
        && value.to_lowercase() != "null"
        && value.to_lowercase() != "none"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MapSource(HashMap<String, String>);

    impl ValueSource for MapSource {
        type Error = String;

        fn value_of(&mut self, reference: &ContextRef) -> Result<String, String> {
            self.0
                .get(&reference.to_string())
                .cloned()
                .ok_or_else(|| reference.to_string())
        }
    }

    fn source() -> MapSource {
        let mut values = HashMap::new();
        values.insert("env.BASE_URL".to_string(), "https://example.com".to_string());
        values.insert("secrets.API_KEY".to_string(), "secret123".to_string());
        values.insert("steps.login.outputs.token".to_string(), "abc123".to_string());
        values.insert("github.ref".to_string(), "refs/heads/main".to_string());
        values.insert("github.sha".to_string(), "deadbeef".to_string());
        MapSource(values)
    }

    #[test]
    fn test_render_env() {
        let template = Template::parse("${{ env.BASE_URL }}/api").unwrap();
        assert_eq!(template.render(&mut source()).unwrap(), "https://example.com/api");
    }

    #[test]
    fn test_render_multiple() {
        let template =
            Template::parse("${{env.BASE_URL}}?token=${{ steps.login.outputs.token }}").unwrap();
        assert_eq!(template.refs().count(), 2);
        assert_eq!(
            template.render(&mut source()).unwrap(),
            "https://example.com?token=abc123"
        );
    }

    #[test]
    fn test_parse_refs() {
        assert_eq!(
            ContextRef::parse("github.sha").unwrap(),
            ContextRef::Github(GithubField::Sha)
        );
        assert_eq!(
            ContextRef::parse("needs.build.outputs.image").unwrap(),
            ContextRef::NeedsOutput {
                job: "build".to_string(),
                output: "image".to_string()
            }
        );
        assert!(matches!(
            ContextRef::parse("matrix.os"),
            Err(ExpressionError::UnknownContext(_))
        ));
        assert!(matches!(
            ContextRef::parse("github.token"),
            Err(ExpressionError::UnknownVariable(_))
        ));
        assert!(matches!(
            ContextRef::parse("steps.build.result"),
            Err(ExpressionError::InvalidSyntax(_))
        ));
        assert!(ContextRef::parse("env.$HOME").is_err());
    }

    #[test]
    fn test_unterminated_expression() {
        assert!(Template::parse("echo ${{ github.sha").is_err());
    }

    #[test]
    fn test_display_round_trips_refs() {
        let template = Template::parse("docker push app:${{github.sha}}").unwrap();
        assert_eq!(template.to_string(), "docker push app:${{ github.sha }}");
    }

    #[test]
    fn test_substitute_inputs() {
        let action = Template::parse("docker build -t ${{ inputs.image }} .").unwrap();
        let mut inputs = BTreeMap::new();
        inputs.insert(
            "image".to_string(),
            Template::parse("app:${{ github.sha }}").unwrap(),
        );

        let bound = action.substitute_inputs(&inputs).unwrap();
        assert_eq!(bound.render(&mut source()).unwrap(), "docker build -t app:deadbeef .");
        assert_eq!(
            action.substitute_inputs(&BTreeMap::new()).unwrap_err(),
            "image"
        );
    }

    #[test]
    fn test_condition_equality() {
        let mut src = source();
        let cond = Condition::parse("github.ref == 'refs/heads/main'").unwrap();
        assert!(cond.evaluate(&mut src).unwrap());

        let cond = Condition::parse("${{ github.ref }} != 'refs/heads/main'").unwrap();
        assert!(!cond.evaluate(&mut src).unwrap());
    }

    #[test]
    fn test_condition_operator_inside_quotes() {
        let cond = Condition::parse("github.ref == 'refs/heads/a!=b'").unwrap();
        assert_eq!(
            cond,
            Condition::Equals(
                Operand::Ref(ContextRef::parse("github.ref").unwrap()),
                Operand::Literal("refs/heads/a!=b".to_string()),
            )
        );

        let cond = Condition::parse("\"x==y\" != env.BASE_URL").unwrap();
        assert!(matches!(cond, Condition::NotEquals(Operand::Literal(ref l), _) if l == "x==y"));

        assert_eq!(
            Condition::parse("'a == b'").unwrap(),
            Condition::Truthy(Operand::Literal("a == b".to_string()))
        );
    }

    #[test]
    fn test_condition_success_and_truthy() {
        let mut src = source();
        assert_eq!(Condition::parse("success()").unwrap(), Condition::Success);
        assert!(Condition::parse("${{ env.BASE_URL }}").unwrap().evaluate(&mut src).unwrap());
        assert!(!Condition::parse("false").unwrap().evaluate(&mut src).unwrap());
    }

    #[test]
    fn test_condition_refs() {
        let cond = Condition::parse("github.ref == env.BASE_URL").unwrap();
        assert_eq!(cond.refs().len(), 2);
        assert!(Condition::parse("success()").unwrap().refs().is_empty());
    }
}
