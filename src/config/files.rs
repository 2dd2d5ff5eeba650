//! Secrets kept out of the main config: any `<key>_file: <path>` entry is
//! replaced by `<key>` holding the file's contents.

use std::path::{Path, PathBuf};

use figment::{
    Error, Metadata, Profile, Provider, Source,
    value::{Dict, Map, Tag, Value},
};

const SUFFIX: &str = "_file";

/// Expands `*_file` keys of the wrapped provider. Relative paths resolve
/// against the directory of the config file that named them, or the working
/// directory for providers that aren't files. One trailing newline is
/// dropped from the contents.
pub struct SecretFileProvider<P> {
    inner: P,
}

impl<P> SecretFileProvider<P> {
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<P: Provider> Provider for SecretFileProvider<P> {
    fn metadata(&self) -> Metadata {
        self.inner.metadata()
    }

    fn data(&self) -> Result<Map<Profile, Dict>, Error> {
        let base = match &self.inner.metadata().source {
            Some(Source::File(path)) => path.parent().map(Path::to_path_buf),
            _ => None,
        }
        .unwrap_or_else(|| PathBuf::from("."));

        self.inner
            .data()?
            .into_iter()
            .map(|(profile, dict)| Ok((profile, expand(&base, dict)?)))
            .collect()
    }

    fn profile(&self) -> Option<Profile> {
        self.inner.profile()
    }
}

fn expand(base: &Path, dict: Dict) -> Result<Dict, Error> {
    let mut out = Dict::new();
    let mut secrets = vec![];

    for (key, value) in dict {
        match key.strip_suffix(SUFFIX) {
            Some(target) if !target.is_empty() => {
                let Value::String(_, path) = value else {
                    return Err(Error::from(format!("{key} must be a path")));
                };
                secrets.push((target.to_string(), read_secret(base, &path)?));
            }
            _ => {
                out.insert(key, descend(base, value)?);
            }
        }
    }

    for (key, secret) in secrets {
        if out.contains_key(&key) {
            return Err(Error::from(format!(
                "both {key} and {key}{SUFFIX} are set"
            )));
        }
        out.insert(key, Value::String(Tag::Default, secret));
    }

    Ok(out)
}

fn descend(base: &Path, value: Value) -> Result<Value, Error> {
    Ok(match value {
        Value::Dict(tag, dict) => Value::Dict(tag, expand(base, dict)?),
        Value::Array(tag, items) => Value::Array(
            tag,
            items
                .into_iter()
                .map(|item| descend(base, item))
                .collect::<Result<_, _>>()?,
        ),
        other => other,
    })
}

fn read_secret(base: &Path, path: &str) -> Result<String, Error> {
    let path = base.join(path);
    let mut contents = std::fs::read_to_string(&path)
        .map_err(|err| Error::from(format!("Failed to read {path:?}: {err}")))?;

    if contents.ends_with('\n') {
        contents.pop();
        if contents.ends_with('\r') {
            contents.pop();
        }
    }

    Ok(contents)
}
