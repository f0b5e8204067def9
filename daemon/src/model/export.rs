// daemon/src/model/export.rs
//! Derived renderings of a recognized formula: markdown, MathML in its
//! prefixed variants and OMML.

use super::worker_process::extract_json;
use anyhow::{anyhow, bail, Context, Result};
use serde::Serialize;
use serde_json::Value;
use snipper_core::deps::python::resolve_python_for_deps;
use snipper_core::utils::process::run_captured;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

pub const MARKDOWN_PAGE_SEPARATOR: &str = "\n\n---\n\n";
pub const LATEX_PAGE_SEPARATOR: &str = "\n\n% --- Page ---\n\n";
const MATHML_NS: &str = "http://www.w3.org/1998/Math/MathML";
const SINGLE_FORMULA_MAX_CHARS: usize = 4000;
const MATHML_PREFIXES: [(&str, &str); 3] = [("mathml_mml", "mml"), ("mathml_m", "m"), ("mathml_attr", "attr")];

/// Converts cleaned LaTeX to MathML, and MathML to OMML when a stylesheet exists.
pub trait MathMlConverter: Send + Sync {
    fn latex_to_mathml(&self, latex: &str) -> Result<String>;

    /// `None` when no OMML transform is available.
    fn mathml_to_omml(&self, _mathml: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

const LATEX2MATHML_CODE: &str = r#"
import json, sys
import latex2mathml.converter
print(json.dumps({"mathml": latex2mathml.converter.convert(sys.argv[1])}))
"#;

const OMML_CODE: &str = r#"
import json, os, sys
out = {"omml": None}
try:
    from lxml import etree
    candidates = [
        os.path.expandvars(r"%ProgramFiles%\Microsoft Office\root\Office16\MML2OMML.XSL"),
        os.path.expandvars(r"%ProgramFiles(x86)%\Microsoft Office\root\Office16\MML2OMML.XSL"),
        os.path.expandvars(r"%ProgramFiles%\Microsoft Office\Office16\MML2OMML.XSL"),
        os.path.expandvars(r"%ProgramFiles%\Microsoft Office\Office19\MML2OMML.XSL"),
    ]
    xsl = next((p for p in candidates if os.path.exists(p)), "")
    if xsl:
        transform = etree.XSLT(etree.parse(xsl))
        doc = transform(etree.fromstring(sys.argv[1].encode("utf-8")))
        out["omml"] = etree.tostring(doc, encoding="unicode") or None
except Exception:
    pass
print(json.dumps(out))
"#;

/// Runs `latex2mathml` (and `lxml` for OMML) in the dependency interpreter.
pub struct PythonMathMlConverter {
    deps_dir: Option<PathBuf>,
    timeout: Duration,
}

impl PythonMathMlConverter {
    pub fn new(deps_dir: Option<PathBuf>) -> Self {
        PythonMathMlConverter { deps_dir, timeout: Duration::from_secs(30) }
    }

    fn run(&self, code: &str, arg: &str) -> Result<serde_json::Map<String, Value>> {
        let (python, _) = resolve_python_for_deps(self.deps_dir.as_deref()).map_err(|e| anyhow!("{}", e))?;
        let mut cmd = Command::new(&python);
        cmd.arg("-c").arg(code).arg(arg).env("PYTHONIOENCODING", "utf-8");
        let out = run_captured(&mut cmd, self.timeout).context("export helper could not start")?;
        if out.timed_out {
            bail!("export helper timed out");
        }
        if !out.success() {
            bail!("{}", out.stderr.lines().last().unwrap_or("export helper failed").trim());
        }
        out.stdout.lines().rev().find_map(extract_json).ok_or_else(|| anyhow!("export helper returned no JSON"))
    }
}

impl MathMlConverter for PythonMathMlConverter {
    fn latex_to_mathml(&self, latex: &str) -> Result<String> {
        let out = self.run(LATEX2MATHML_CODE, latex)?;
        Ok(out.get("mathml").and_then(Value::as_str).unwrap_or("").to_string())
    }

    fn mathml_to_omml(&self, mathml: &str) -> Result<Option<String>> {
        let out = self.run(OMML_CODE, mathml)?;
        Ok(out.get("omml").and_then(Value::as_str).map(str::to_string))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExportFormats {
    pub formats: BTreeMap<String, String>,
    pub errors: BTreeMap<String, String>,
}

pub struct FormulaExporter {
    converter: Box<dyn MathMlConverter>,
}

impl FormulaExporter {
    pub fn new(converter: Box<dyn MathMlConverter>) -> Self {
        FormulaExporter { converter }
    }

    /// Per-format failures land in `errors`; the call itself never fails.
    pub fn export(&self, latex: &str) -> ExportFormats {
        let result = latex.trim();
        let mut out = ExportFormats::default();
        out.formats.insert("latex".into(), result.to_string());
        out.formats.insert("markdown".into(), to_markdown_from_latex(result));
        if result.is_empty() {
            return out;
        }

        let mathml = self
            .converter
            .latex_to_mathml(&normalize_latex_for_export(result))
            .map(|raw| mathml_standardize(&raw));
        match mathml {
            Ok(mathml) => {
                for (key, prefix) in MATHML_PREFIXES {
                    out.formats.insert(key.into(), mathml_with_prefix(&mathml, prefix));
                }
                let omml = match self.converter.mathml_to_omml(&mathml) {
                    Ok(Some(omml)) if !omml.is_empty() => omml,
                    Ok(_) => mathml.clone(),
                    Err(e) => {
                        log::debug!("omml transform failed, using mathml: {:#}", e);
                        mathml.clone()
                    }
                };
                out.formats.insert("omml".into(), omml);
                out.formats.insert("mathml".into(), mathml);
            }
            Err(e) => {
                let msg = format!("{:#}", e);
                for key in ["mathml", "mathml_mml", "mathml_m", "mathml_attr", "omml"] {
                    out.errors.insert(key.into(), msg.clone());
                }
            }
        }
        out
    }
}

pub fn to_markdown_from_latex(text: &str) -> String {
    let raw = text.trim();
    if raw.is_empty() {
        String::new()
    } else {
        format!("$$\n{}\n$$\n", raw)
    }
}

pub fn to_latex_from_markdown(text: &str) -> String {
    let raw = text.trim();
    let raw = raw.strip_prefix("$$").unwrap_or(raw);
    let raw = raw.strip_suffix("$$").unwrap_or(raw);
    raw.trim().to_string()
}

/// Short, single-page content that is worth exporting as one formula.
pub fn looks_like_single_formula(text: &str) -> bool {
    let raw = text.trim();
    if raw.is_empty() || raw.chars().count() > SINGLE_FORMULA_MAX_CHARS {
        return false;
    }
    if raw.contains(MARKDOWN_PAGE_SEPARATOR) || raw.contains(LATEX_PAGE_SEPARATOR) {
        return false;
    }
    !raw.contains('\n') || raw.starts_with("$$")
}

fn strip_math_delimiters(latex: &str) -> &str {
    let text = latex.trim();
    if text.len() >= 4 && text.starts_with("$$") && text.ends_with("$$") {
        return text[2..text.len() - 2].trim();
    }
    if text.len() >= 2 && text.starts_with('$') && text.ends_with('$') {
        return text[1..text.len() - 1].trim();
    }
    text
}

const SPACED_COMMANDS: [&str; 4] = ["\\sum", "\\frac", "\\dfrac", "\\tfrac"];

pub fn normalize_latex_for_export(latex: &str) -> String {
    let text = strip_math_delimiters(latex);
    let chars: Vec<char> = text.chars().collect();

    // ^{x} and _{x} around a single alphanumeric lose their braces.
    let mut unbraced = String::with_capacity(text.len());
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if (c == '^' || c == '_')
            && chars.get(i + 1) == Some(&'{')
            && chars.get(i + 2).is_some_and(|x| x.is_ascii_alphanumeric())
            && chars.get(i + 3) == Some(&'}')
        {
            unbraced.push(c);
            unbraced.push(chars[i + 2]);
            i += 4;
        } else {
            unbraced.push(c);
            i += 1;
        }
    }
    let text = unbraced.replace(":=", " := ");

    let mut spaced = String::with_capacity(text.len() + 8);
    for (idx, c) in text.char_indices() {
        if c == '\\' && SPACED_COMMANDS.iter().any(|cmd| text[idx..].starts_with(cmd)) {
            if spaced.chars().last().is_some_and(|prev| !prev.is_whitespace()) {
                spaced.push(' ');
            }
        }
        spaced.push(c);
    }

    let mut collapsed = String::with_capacity(spaced.len());
    for c in spaced.chars() {
        let blank = c == ' ' || c == '\t';
        if blank {
            if !collapsed.ends_with(' ') {
                collapsed.push(' ');
            }
        } else {
            collapsed.push(c);
        }
    }
    collapsed.trim().to_string()
}

/// Byte range of the first `<math ...>` start tag and its attribute text.
fn math_root(mathml: &str) -> Option<(usize, usize, &str)> {
    let mut from = 0;
    while let Some(pos) = mathml[from..].find("<math") {
        let start = from + pos;
        let after = start + "<math".len();
        let boundary = mathml[after..].chars().next().is_some_and(|c| !(c.is_alphanumeric() || c == '_'));
        if boundary {
            let close = after + mathml[after..].find('>')?;
            return Some((start, close + 1, &mathml[after..close]));
        }
        from = after;
    }
    None
}

fn has_attr(attrs: &str, name: &str) -> bool {
    let mut from = 0;
    while let Some(pos) = attrs[from..].find(name) {
        let start = from + pos;
        let before_ok = attrs[..start].chars().last().map_or(true, |c| !(c.is_alphanumeric() || c == '_'));
        let rest = attrs[start + name.len()..].trim_start();
        if before_ok && rest.starts_with('=') {
            return true;
        }
        from = start + name.len();
    }
    false
}

fn join_attr(attrs: &str, extra: &str) -> String {
    if attrs.is_empty() || attrs.ends_with(' ') {
        format!("{}{}", attrs, extra)
    } else {
        format!("{} {}", attrs, extra)
    }
}

fn ensure_mathml_block(mathml: &str) -> String {
    match math_root(mathml) {
        Some((start, end, attrs)) if !has_attr(attrs, "display") => format!(
            "{}<math{}>{}",
            &mathml[..start],
            join_attr(attrs, "display=\"block\""),
            &mathml[end..]
        ),
        _ => mathml.to_string(),
    }
}

/// Length of a `<tag> body </tag>` element at the head of `s`, if one is there.
fn match_element(s: &str, tag: &str, bodies: &[&str], pad_inner: bool) -> Option<usize> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let rest = s.strip_prefix(open.as_str())?.trim_start();
    let body = bodies.iter().find(|b| rest.starts_with(**b))?;
    let mut rest = &rest[body.len()..];
    if pad_inner {
        rest = rest.trim_start();
    }
    let rest = rest.strip_prefix(close.as_str())?;
    Some(s.len() - rest.len())
}

pub fn mathml_standardize(mathml: &str) -> String {
    let value = ensure_mathml_block(mathml);
    let infinity = ["&#x221E;", "&#X221E;", "\u{221E}"];
    let mut out = String::with_capacity(value.len());
    let mut i = 0;
    while i < value.len() {
        let rest = &value[i..];
        if let Some(colon_len) = match_element(rest, "mo", &[":"], false) {
            let tail = rest[colon_len..].trim_start();
            if let Some(eq_len) = match_element(tail, "mo", &["="], true) {
                out.push_str("<mo>:=</mo>");
                i += rest.len() - tail.len() + eq_len;
                continue;
            }
        }
        if let Some(len) = match_element(rest, "mi", &infinity, true) {
            out.push_str("<mi mathvariant=\"normal\">&#x221E;</mi>");
            i += len;
            continue;
        }
        let c = rest.chars().next().unwrap_or_default();
        out.push(c);
        i += c.len_utf8().max(1);
    }
    out.replace('\u{2211}', "&#x2211;").replace('\u{221E}', "&#x221E;")
}

fn is_tag_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '-')
}

/// Moves every element into `prefix`, declaring the MathML namespace on the root.
pub fn mathml_with_prefix(mathml: &str, prefix: &str) -> String {
    if mathml.is_empty() {
        return String::new();
    }
    let mut value = ensure_mathml_block(mathml);
    if let Some((start, end, attrs)) = math_root(&value) {
        let mut attrs = strip_default_xmlns(attrs);
        if !attrs.contains(&format!("xmlns:{}=", prefix)) {
            attrs = join_attr(&attrs, &format!("xmlns:{}=\"{}\"", prefix, MATHML_NS));
        }
        value = format!("{}<{}:math{}>{}", &value[..start], prefix, attrs, &value[end..]);
    }
    let value = value.replace("</math>", &format!("</{}:math>", prefix));

    let mut out = String::with_capacity(value.len() + 64);
    let mut rest = value.as_str();
    while let Some(pos) = rest.find('<') {
        out.push_str(&rest[..pos]);
        let tag = &rest[pos..];
        let slash = if tag[1..].starts_with('/') { "/" } else { "" };
        let name_start = 1 + slash.len();
        let name_len = tag[name_start..].chars().take_while(|c| is_tag_name_char(*c)).count();
        let name = &tag[name_start..name_start + name_len];
        let starts_alpha = name.chars().next().is_some_and(|c| c.is_ascii_alphabetic());
        match tag.find('>') {
            Some(close) if starts_alpha && !name.contains(':') && !tag[1..close].contains('<') => {
                out.push_str(&format!("<{}{}:{}{}", slash, prefix, name, &tag[name_start + name_len..=close]));
                rest = &tag[close + 1..];
            }
            _ => {
                out.push('<');
                rest = &tag[1..];
            }
        }
    }
    out.push_str(rest);
    out
}

fn strip_default_xmlns(attrs: &str) -> String {
    let mut out = attrs.to_string();
    while let Some(pos) = out.find("xmlns=\"") {
        let ws_start = out[..pos].trim_end().len();
        if ws_start == pos {
            break;
        }
        let value_start = pos + "xmlns=\"".len();
        match out[value_start..].find('"') {
            Some(end) => out.replace_range(ws_start..value_start + end + 1, ""),
            None => break,
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Wraps the LaTeX in a fixed MathML shell, or fails on `\bad`.
    pub struct StubConverter;

    impl MathMlConverter for StubConverter {
        fn latex_to_mathml(&self, latex: &str) -> Result<String> {
            if latex.contains("\\bad") {
                bail!("unsupported command \\bad");
            }
            Ok(format!(
                "<math xmlns=\"{}\"><mrow><mi>{}</mi><mo>:</mo><mo>=</mo><mi>\u{221E}</mi></mrow></math>",
                MATHML_NS, latex
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::StubConverter;
    use super::*;

    #[test]
    fn latex_is_normalized_before_conversion() {
        assert_eq!(normalize_latex_for_export("$$x^{2}+y_{i}$$"), "x^2+y_i");
        assert_eq!(normalize_latex_for_export("$a^{10}$"), "a^{10}");
        assert_eq!(normalize_latex_for_export("f:=x"), "f := x");
        assert_eq!(normalize_latex_for_export("a=\\frac{1}{2}+b\\sum_i"), "a= \\frac{1}{2}+b \\sum_i");
        assert_eq!(normalize_latex_for_export("x \\dfrac{1}{2}\t\t y"), "x \\dfrac{1}{2} y");
        assert_eq!(normalize_latex_for_export("  $ $ "), "");
    }

    #[test]
    fn mathml_gets_block_display_and_entities() {
        let raw = "<math><mo>:</mo> <mo> = </mo><mi> \u{221E} </mi><mo>\u{2211}</mo></math>";
        assert_eq!(
            mathml_standardize(raw),
            "<math display=\"block\"><mo>:=</mo><mi mathvariant=\"normal\">&#x221E;</mi><mo>&#x2211;</mo></math>"
        );
        let inline = "<math display=\"inline\"><mi>x</mi></math>";
        assert_eq!(mathml_standardize(inline), inline);
    }

    #[test]
    fn prefixed_mathml_moves_the_namespace() {
        let mathml = "<math xmlns=\"http://www.w3.org/1998/Math/MathML\" display=\"block\"><mi>x</mi><mo>+</mo></math>";
        assert_eq!(
            mathml_with_prefix(mathml, "mml"),
            "<mml:math display=\"block\" xmlns:mml=\"http://www.w3.org/1998/Math/MathML\"><mml:mi>x</mml:mi><mml:mo>+</mml:mo></mml:math>"
        );
        assert_eq!(mathml_with_prefix("", "m"), "");
    }

    #[test]
    fn export_collects_every_format() {
        let exporter = FormulaExporter::new(Box::new(StubConverter));
        let out = exporter.export("  f^{x}  ");
        assert_eq!(out.formats["latex"], "f^{x}");
        assert_eq!(out.formats["markdown"], "$$\nf^{x}\n$$\n");
        assert!(out.formats["mathml"].contains("<mi>f^x</mi>"));
        assert!(out.formats["mathml"].contains("<mo>:=</mo>"));
        assert!(out.formats["mathml_m"].starts_with("<m:math"));
        assert_eq!(out.formats["omml"], out.formats["mathml"]);
        assert!(out.errors.is_empty());
    }

    #[test]
    fn conversion_failure_is_reported_per_format() {
        let exporter = FormulaExporter::new(Box::new(StubConverter));
        let out = exporter.export("\\bad{x}");
        assert_eq!(out.formats.len(), 2);
        assert_eq!(out.errors.len(), 5);
        assert!(out.errors["omml"].contains("unsupported"));

        let empty = exporter.export("   ");
        assert_eq!(empty.formats["markdown"], "");
        assert!(empty.errors.is_empty());
    }

    #[test]
    fn single_formula_heuristic() {
        assert!(looks_like_single_formula("x^2"));
        assert!(looks_like_single_formula("$$\nx^2\n$$"));
        assert!(!looks_like_single_formula("line one\nline two"));
        assert!(!looks_like_single_formula("a\n\n---\n\nb"));
        assert!(!looks_like_single_formula(&"x".repeat(4001)));
        assert!(!looks_like_single_formula(""));
        assert_eq!(to_latex_from_markdown("$$\nx^2\n$$\n"), "x^2");
        assert_eq!(to_markdown_from_latex(" x "), "$$\nx\n$$\n");
    }
}
