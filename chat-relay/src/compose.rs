//! Terminal input for the chat client.
//!
//! Plain lines are sent as text. A few slash commands attach files or leave:
//!
//! - `/file <path>` sends any file as FILE
//! - `/image <path>` sends an image as IMAGE
//! - `/quit` leaves the chat

use std::path::{Path, PathBuf};

use anyhow::{Result, anyhow, bail};

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "bmp", "webp"];

#[derive(Debug, PartialEq, Eq)]
pub enum Compose {
    Text(String),
    File(PathBuf),
    Image(PathBuf),
    Quit,
}

impl Compose {
    /// Parses one line of input. Blank input yields `Ok(None)`.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }

        if !trimmed.starts_with('/') {
            return Ok(Some(Compose::Text(trimmed.to_string())));
        }

        let (command, argument) = match trimmed.split_once(char::is_whitespace) {
            Some((command, rest)) => (command, rest.trim()),
            None => (trimmed, ""),
        };

        match (command.to_lowercase().as_str(), argument) {
            ("/quit", _) => Ok(Some(Compose::Quit)),
            ("/file", "") => Err(anyhow!("usage: /file <path>")),
            ("/image", "") => Err(anyhow!("usage: /image <path>")),
            ("/file", path) => Ok(Some(Compose::File(PathBuf::from(path)))),
            ("/image", path) => {
                let path = PathBuf::from(path);
                ensure_image(&path)?;
                Ok(Some(Compose::Image(path)))
            }
            // Unknown commands are ordinary text, e.g. "/shrug".
            _ => Ok(Some(Compose::Text(trimmed.to_string()))),
        }
    }
}

fn ensure_image(path: &Path) -> Result<()> {
    let is_image = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
        .unwrap_or(false);
    if !is_image {
        bail!("{} is not an image file", path.display());
    }
    Ok(())
}
