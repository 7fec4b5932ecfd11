//! Fichiers statiques (pages de l'auditeur et du contrôleur)

use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

/// Page d'accueil de l'auditeur, relative au répertoire public
pub const HOME_PAGE: &str = "home/index.html";

/// Page du contrôleur, relative au répertoire public
pub const CONTROLLER_PAGE: &str = "controller/index.html";

/// Type MIME servi pour un fichier, d'après son extension
pub fn content_type_for(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "html" => Some("text/html"),
        "css" => Some("text/css"),
        "js" => Some("text/javascript"),
        _ => None,
    }
}

/// Résout `request` sous `public_dir`
///
/// Les chemins absolus ou contenant `..` sont traités comme introuvables.
pub fn resolve_public(public_dir: &Path, request: &str) -> Result<PathBuf> {
    let relative = Path::new(request.trim_start_matches('/'));
    let mut resolved = public_dir.to_path_buf();

    for component in relative.components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            _ => return Err(not_found(request)),
        }
    }

    Ok(resolved)
}

/// Ouvre un fichier public et retourne son type MIME
pub async fn open_public(
    public_dir: &Path,
    request: &str,
) -> Result<(tokio::fs::File, Option<&'static str>)> {
    let path = resolve_public(public_dir, request)?;

    let metadata = tokio::fs::metadata(&path).await?;
    if !metadata.is_file() {
        return Err(not_found(request));
    }

    let file = tokio::fs::File::open(&path).await?;
    Ok((file, content_type_for(&path)))
}

fn not_found(request: &str) -> Error {
    Error::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("{} not found", request),
    ))
}
