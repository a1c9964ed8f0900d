//! Parser for the control-channel model command.
//!
//! The command blob is either `TRUE ` followed by a model object, or anything
//! else (including `FALSE` and blobs shorter than five bytes), which clears
//! the installed model. The object payload is a dictionary syntax resembling
//! JSON with two substitutions: `;` separates elements instead of `,`, and no
//! whitespace is permitted outside quoted strings.
//!
//! Each HMM object is parsed in two passes: the first pass collects the state
//! and observation spaces and skips the probability sections, the second pass
//! fills the probability tables and resolves names by index. A single error
//! anywhere fails the whole load; no partial model is ever produced.

use thiserror::Error;

use crate::model::{Emission, Hmm, MAX_OBS_CODE_LEN, MAX_STATE_NAME_LEN, ModelPair, ObsCode};

/// What a control blob asks the registry to do.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelCommand {
    /// Replace the installed model-pair.
    Install(ModelPair),
    /// Remove any installed model-pair.
    Clear,
}

/// Structural errors raised while loading a model.
///
/// All variants are non-fatal to the process; the registry keeps the
/// previously installed model when a load fails.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ModelError {
    #[error("malformed model syntax at byte {pos}: {what}")]
    MalformedSyntax { pos: usize, what: String },
    #[error("unknown state name '{0}'")]
    UnknownStateName(String),
    #[error("unknown observation code '{0}'")]
    UnknownObsCode(String),
    #[error("emission tuple for '{code}' has {got} values, expected {want}")]
    WrongEmissionArity {
        code: String,
        got: usize,
        want: usize,
    },
    #[error("section '{0}' appears more than once")]
    DuplicateSection(&'static str),
    #[error("{0}")]
    InternalLimitExceeded(&'static str),
}

const KEY_PACKET_MODEL: &str = "packet_model";
const KEY_STREAM_MODEL: &str = "stream_model";
const HMM_SECTIONS: [&str; 5] = [
    "state_space",
    "observation_space",
    "start_probability",
    "transition_probability",
    "emission_probability",
];

/// Interpret a control blob.
///
/// `TRUE <object>` parses the object into a model-pair; `FALSE`, blobs
/// shorter than five bytes, and blobs with any other prefix all request a
/// clear. Only an ill-formed object after a `TRUE ` prefix is an error.
pub fn parse_command(blob: &[u8]) -> Result<ModelCommand, ModelError> {
    if blob.len() < 5 || !blob[..5].eq_ignore_ascii_case(b"TRUE ") {
        return Ok(ModelCommand::Clear);
    }
    let body = std::str::from_utf8(&blob[5..]).map_err(|e| ModelError::MalformedSyntax {
        pos: 5 + e.valid_up_to(),
        what: "model is not valid UTF-8".into(),
    })?;
    parse_model_object(body).map(ModelCommand::Install)
}

/// Parse a bare model object (without the `TRUE ` prefix).
///
/// Accepts the nested form with `packet_model` / `stream_model` keys, and the
/// legacy flat form where the HMM sections appear directly at top level (the
/// flat form is treated as the packet model).
pub fn parse_model_object(text: &str) -> Result<ModelPair, ModelError> {
    let text = text.trim_end_matches(['\r', '\n', '\0', ' ']);

    // Probe the first key to detect the legacy flat form.
    let mut probe = Cursor::new(text, 0);
    probe.expect(b'{')?;
    if !probe.eat(b'}') {
        let key = probe.quoted(MAX_STATE_NAME_LEN, "section name longer than 63 bytes")?;
        if HMM_SECTIONS.contains(&key) {
            let hmm = parse_hmm(text, 0)?;
            return Ok(ModelPair {
                packets: Some(hmm),
                streams: None,
            });
        }
    }

    let mut pair = ModelPair::default();
    let mut cur = Cursor::new(text, 0);
    cur.expect(b'{')?;
    if cur.eat(b'}') {
        return Ok(pair);
    }
    loop {
        let key_pos = cur.abs_pos();
        let key = cur.quoted(MAX_STATE_NAME_LEN, "section name longer than 63 bytes")?;
        cur.expect(b':')?;
        match key {
            KEY_PACKET_MODEL => {
                if pair.packets.is_some() {
                    return Err(ModelError::DuplicateSection(KEY_PACKET_MODEL));
                }
                let (slice, base) = cur.balanced_slice()?;
                pair.packets = Some(parse_hmm(slice, base)?);
            }
            KEY_STREAM_MODEL => {
                if pair.streams.is_some() {
                    return Err(ModelError::DuplicateSection(KEY_STREAM_MODEL));
                }
                let (slice, base) = cur.balanced_slice()?;
                pair.streams = Some(parse_hmm(slice, base)?);
            }
            _ => {
                return Err(ModelError::MalformedSyntax {
                    pos: key_pos,
                    what: format!("unrecognised top-level key '{key}'"),
                });
            }
        }
        if cur.eat(b';') {
            continue;
        }
        cur.expect(b'}')?;
        break;
    }
    Ok(pair)
}

/// Parse one HMM object in two passes: spaces first, probabilities second.
fn parse_hmm(text: &str, base: usize) -> Result<Hmm, ModelError> {
    // Pass 1: state and observation spaces.
    let mut states: Option<Vec<String>> = None;
    let mut obs: Option<Vec<String>> = None;
    each_section(text, base, |key, cur| {
        match key {
            "state_space" => {
                if states.is_some() {
                    return Err(ModelError::DuplicateSection("state_space"));
                }
                states = Some(parse_state_list(cur)?);
            }
            "observation_space" => {
                if obs.is_some() {
                    return Err(ModelError::DuplicateSection("observation_space"));
                }
                obs = Some(parse_obs_list(cur)?);
            }
            _ => cur.skip_balanced()?,
        }
        Ok(())
    })?;

    let missing = |what: &str, pos: usize| ModelError::MalformedSyntax {
        pos,
        what: format!("model has no {what}"),
    };
    let states = states.ok_or_else(|| missing("state_space", base))?;
    let obs = obs.ok_or_else(|| missing("observation_space", base))?;
    if states.is_empty() {
        return Err(missing("states", base));
    }
    if obs.is_empty() {
        return Err(missing("observation codes", base));
    }
    let mut hmm = Hmm::with_spaces(states, obs);

    // Pass 2: probability tables, resolving names against the spaces.
    let mut seen_start = false;
    let mut seen_trans = false;
    let mut seen_emit = false;
    each_section(text, base, |key, cur| {
        match key {
            "state_space" | "observation_space" => cur.skip_balanced()?,
            "start_probability" => {
                if seen_start {
                    return Err(ModelError::DuplicateSection("start_probability"));
                }
                seen_start = true;
                parse_start_probs(cur, &mut hmm)?;
            }
            "transition_probability" => {
                if seen_trans {
                    return Err(ModelError::DuplicateSection("transition_probability"));
                }
                seen_trans = true;
                parse_trans_probs(cur, &mut hmm)?;
            }
            "emission_probability" => {
                if seen_emit {
                    return Err(ModelError::DuplicateSection("emission_probability"));
                }
                seen_emit = true;
                parse_emit_probs(cur, &mut hmm)?;
            }
            _ => unreachable!("section names are filtered before dispatch"),
        }
        Ok(())
    })?;

    Ok(hmm)
}

/// Walk the sections of an HMM object, validating key names and separators.
fn each_section<'a>(
    text: &'a str,
    base: usize,
    mut handle: impl FnMut(&'a str, &mut Cursor<'a>) -> Result<(), ModelError>,
) -> Result<(), ModelError> {
    let mut cur = Cursor::new(text, base);
    cur.expect(b'{')?;
    if cur.eat(b'}') {
        return Ok(());
    }
    loop {
        let key_pos = cur.abs_pos();
        let key = cur.quoted(MAX_STATE_NAME_LEN, "section name longer than 63 bytes")?;
        if !HMM_SECTIONS.contains(&key) {
            return Err(ModelError::MalformedSyntax {
                pos: key_pos,
                what: format!("unrecognised section name '{key}'"),
            });
        }
        cur.expect(b':')?;
        handle(key, &mut cur)?;
        if cur.eat(b';') {
            continue;
        }
        cur.expect(b'}')?;
        break;
    }
    Ok(())
}

fn parse_state_list(cur: &mut Cursor<'_>) -> Result<Vec<String>, ModelError> {
    let mut names: Vec<String> = Vec::new();
    cur.expect(b'[')?;
    if cur.eat(b']') {
        return Ok(names);
    }
    loop {
        let pos = cur.abs_pos();
        let name = cur.quoted(MAX_STATE_NAME_LEN, "state name longer than 63 bytes")?;
        if names.iter().any(|n| n == name) {
            return Err(ModelError::MalformedSyntax {
                pos,
                what: format!("duplicate state name '{name}'"),
            });
        }
        names.push(name.to_string());
        if cur.eat(b';') {
            continue;
        }
        cur.expect(b']')?;
        break;
    }
    Ok(names)
}

fn parse_obs_list(cur: &mut Cursor<'_>) -> Result<Vec<String>, ModelError> {
    let mut codes: Vec<String> = Vec::new();
    cur.expect(b'[')?;
    if cur.eat(b']') {
        return Ok(codes);
    }
    loop {
        let pos = cur.abs_pos();
        let code = cur.quoted(MAX_OBS_CODE_LEN, "observation code longer than 7 bytes")?;
        if ObsCode::from_str(code).is_none() {
            return Err(ModelError::UnknownObsCode(code.to_string()));
        }
        if codes.iter().any(|c| c == code) {
            return Err(ModelError::MalformedSyntax {
                pos,
                what: format!("duplicate observation code '{code}'"),
            });
        }
        codes.push(code.to_string());
        if cur.eat(b';') {
            continue;
        }
        cur.expect(b']')?;
        break;
    }
    Ok(codes)
}

fn parse_start_probs(cur: &mut Cursor<'_>, hmm: &mut Hmm) -> Result<(), ModelError> {
    cur.expect(b'{')?;
    if cur.eat(b'}') {
        return Ok(());
    }
    loop {
        let name = cur.quoted(MAX_STATE_NAME_LEN, "state name longer than 63 bytes")?;
        let i = hmm
            .state_index(name)
            .ok_or_else(|| ModelError::UnknownStateName(name.to_string()))?;
        cur.expect(b':')?;
        hmm.start[i] = cur.number()?;
        if cur.eat(b';') {
            continue;
        }
        cur.expect(b'}')?;
        break;
    }
    Ok(())
}

fn parse_trans_probs(cur: &mut Cursor<'_>, hmm: &mut Hmm) -> Result<(), ModelError> {
    cur.expect(b'{')?;
    if cur.eat(b'}') {
        return Ok(());
    }
    loop {
        let src = cur.quoted(MAX_STATE_NAME_LEN, "state name longer than 63 bytes")?;
        let i = hmm
            .state_index(src)
            .ok_or_else(|| ModelError::UnknownStateName(src.to_string()))?;
        cur.expect(b':')?;
        cur.expect(b'{')?;
        if !cur.eat(b'}') {
            loop {
                let dst = cur.quoted(MAX_STATE_NAME_LEN, "state name longer than 63 bytes")?;
                let j = hmm
                    .state_index(dst)
                    .ok_or_else(|| ModelError::UnknownStateName(dst.to_string()))?;
                cur.expect(b':')?;
                hmm.trans[i][j] = cur.number()?;
                if cur.eat(b';') {
                    continue;
                }
                cur.expect(b'}')?;
                break;
            }
        }
        if cur.eat(b';') {
            continue;
        }
        cur.expect(b'}')?;
        break;
    }
    Ok(())
}

fn parse_emit_probs(cur: &mut Cursor<'_>, hmm: &mut Hmm) -> Result<(), ModelError> {
    cur.expect(b'{')?;
    if cur.eat(b'}') {
        return Ok(());
    }
    loop {
        let name = cur.quoted(MAX_STATE_NAME_LEN, "state name longer than 63 bytes")?;
        let i = hmm
            .state_index(name)
            .ok_or_else(|| ModelError::UnknownStateName(name.to_string()))?;
        cur.expect(b':')?;
        cur.expect(b'{')?;
        if !cur.eat(b'}') {
            loop {
                let code = cur.quoted(MAX_OBS_CODE_LEN, "observation code longer than 7 bytes")?;
                let k = hmm
                    .obs_index(code)
                    .ok_or_else(|| ModelError::UnknownObsCode(code.to_string()))?;
                let terminal = code == ObsCode::End.as_str();
                let code = code.to_string();
                cur.expect(b':')?;
                let vals = parse_number_list(cur)?;
                let want = if terminal { 1 } else { 4 };
                if vals.len() != want {
                    return Err(ModelError::WrongEmissionArity {
                        code,
                        got: vals.len(),
                        want,
                    });
                }
                hmm.emit[i][k] = Emission {
                    dp: vals[0],
                    mu: vals.get(1).copied().unwrap_or(0.0),
                    sigma: vals.get(2).copied().unwrap_or(0.0),
                    lambda: vals.get(3).copied().unwrap_or(0.0),
                };
                if cur.eat(b';') {
                    continue;
                }
                cur.expect(b'}')?;
                break;
            }
        }
        if cur.eat(b';') {
            continue;
        }
        cur.expect(b'}')?;
        break;
    }
    Ok(())
}

fn parse_number_list(cur: &mut Cursor<'_>) -> Result<Vec<f64>, ModelError> {
    let mut vals = Vec::new();
    cur.expect(b'[')?;
    if cur.eat(b']') {
        return Ok(vals);
    }
    loop {
        vals.push(cur.number()?);
        if cur.eat(b';') {
            continue;
        }
        cur.expect(b']')?;
        break;
    }
    Ok(vals)
}

// ---------------------------------------------------------------------------
// Low-level cursor
// ---------------------------------------------------------------------------

/// Byte cursor over the model text. `base` offsets reported positions so
/// errors inside nested HMM objects point into the original blob.
struct Cursor<'a> {
    text: &'a str,
    pos: usize,
    base: usize,
}

impl<'a> Cursor<'a> {
    fn new(text: &'a str, base: usize) -> Self {
        Self { text, pos: 0, base }
    }

    fn abs_pos(&self) -> usize {
        self.base + self.pos
    }

    fn peek(&self) -> Option<u8> {
        self.text.as_bytes().get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn eat(&mut self, b: u8) -> bool {
        if self.peek() == Some(b) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn expect(&mut self, b: u8) -> Result<(), ModelError> {
        if self.eat(b) {
            return Ok(());
        }
        Err(ModelError::MalformedSyntax {
            pos: self.abs_pos(),
            what: match self.peek() {
                Some(got) => format!("expected '{}', found '{}'", b as char, got as char),
                None => format!("expected '{}', found end of input", b as char),
            },
        })
    }

    /// Read a quoted string. Rejects empty names and names longer than
    /// `max_len` bytes (with `limit_msg` as the error).
    fn quoted(&mut self, max_len: usize, limit_msg: &'static str) -> Result<&'a str, ModelError> {
        self.expect(b'"')?;
        let start = self.pos;
        loop {
            match self.bump() {
                Some(b'"') => break,
                Some(_) => {}
                None => {
                    return Err(ModelError::MalformedSyntax {
                        pos: self.base + start,
                        what: "unterminated string".into(),
                    });
                }
            }
        }
        let s = &self.text[start..self.pos - 1];
        if s.is_empty() {
            return Err(ModelError::MalformedSyntax {
                pos: self.base + start,
                what: "empty name".into(),
            });
        }
        if s.len() > max_len {
            return Err(ModelError::InternalLimitExceeded(limit_msg));
        }
        Ok(s)
    }

    /// Read a signed floating-point literal.
    fn number(&mut self) -> Result<f64, ModelError> {
        let start = self.pos;
        while matches!(
            self.peek(),
            Some(b'0'..=b'9' | b'.' | b'-' | b'+' | b'e' | b'E')
        ) {
            self.pos += 1;
        }
        let s = &self.text[start..self.pos];
        if s.is_empty() {
            return Err(ModelError::MalformedSyntax {
                pos: self.base + start,
                what: "expected a number".into(),
            });
        }
        s.parse::<f64>().map_err(|_| ModelError::MalformedSyntax {
            pos: self.base + start,
            what: format!("invalid number '{s}'"),
        })
    }

    /// Skip a balanced `{…}` or `[…]` value, ignoring delimiters inside
    /// quoted strings.
    fn skip_balanced(&mut self) -> Result<(), ModelError> {
        self.balanced_slice().map(|_| ())
    }

    /// Consume a balanced `{…}` or `[…]` value and return it (with its
    /// absolute start position) for a nested parse.
    fn balanced_slice(&mut self) -> Result<(&'a str, usize), ModelError> {
        let start = self.pos;
        let open = self.peek().ok_or_else(|| ModelError::MalformedSyntax {
            pos: self.abs_pos(),
            what: "expected an object or list, found end of input".into(),
        })?;
        let close = match open {
            b'{' => b'}',
            b'[' => b']',
            _ => {
                return Err(ModelError::MalformedSyntax {
                    pos: self.abs_pos(),
                    what: format!("expected an object or list, found '{}'", open as char),
                });
            }
        };
        self.pos += 1;
        let mut depth = 1usize;
        let mut in_string = false;
        while depth > 0 {
            let c = self.bump().ok_or_else(|| ModelError::MalformedSyntax {
                pos: self.base + start,
                what: "unbalanced delimiters".into(),
            })?;
            if in_string {
                if c == b'"' {
                    in_string = false;
                }
                continue;
            }
            if c == b'"' {
                in_string = true;
            } else if c == open {
                depth += 1;
            } else if c == close {
                depth -= 1;
            }
        }
        Ok((&self.text[start..self.pos], self.base + start))
    }
}
