pub mod decode;
pub mod simulate;
pub mod validate;

use std::path::Path;

use cellscope_core::{ModelCommand, ModelPair, parse_command, parse_model_object};

/// Load a model file: either a control blob (`TRUE …` / `FALSE`) or a bare
/// model object.
pub fn load_model(path: &Path) -> Result<ModelPair, String> {
    let raw = std::fs::read(path).map_err(|e| format!("cannot read {}: {e}", path.display()))?;
    let parsed = if raw.first() == Some(&b'{') {
        let text = std::str::from_utf8(&raw)
            .map_err(|_| format!("{} is not valid UTF-8", path.display()))?;
        parse_model_object(text).map(ModelCommand::Install)
    } else {
        parse_command(&raw)
    };
    match parsed {
        Ok(ModelCommand::Install(pair)) => Ok(pair),
        Ok(ModelCommand::Clear) => Err(format!(
            "{} is a clear command, not a model",
            path.display()
        )),
        Err(err) => Err(format!("cannot parse {}: {err}", path.display())),
    }
}

/// Select one track's HMM out of the pair.
pub fn select_track<'a>(
    pair: &'a ModelPair,
    track: &str,
) -> Result<&'a cellscope_core::Hmm, String> {
    let hmm = match track {
        "streams" => pair.streams.as_ref(),
        _ => pair.packets.as_ref(),
    };
    hmm.ok_or_else(|| format!("the model file has no {track} model"))
}
