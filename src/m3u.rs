//! M3U playlist output.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Write `tracks` as an extended M3U playlist, appending the `.m3u`
/// suffix when missing. Returns the path actually written.
pub fn save(path: &Path, tracks: &[String]) -> Result<PathBuf> {
    let mut target = path.as_os_str().to_os_string();
    if !path.to_string_lossy().ends_with(".m3u") {
        target.push(".m3u");
    }
    let target = PathBuf::from(target);

    let mut file = std::fs::File::create(&target)
        .map_err(|e| Error::Usage(format!("cannot write playlist {}: {e}", target.display())))?;
    let mut body = String::from("#EXTM3U\n");
    for track in tracks {
        body.push_str(track);
        body.push('\n');
    }
    file.write_all(body.as_bytes())
        .map_err(|e| Error::Usage(format!("cannot write playlist {}: {e}", target.display())))?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn writes_header_and_one_path_per_line() {
        let dir = tempfile::tempdir().expect("temp dir");
        let out = save(
            &dir.path().join("mix.m3u"),
            &["/m/a.mp3".to_string(), "/m/b.flac".to_string()],
        )
        .expect("save");

        let text = std::fs::read_to_string(out).expect("read back");
        assert_eq!(text, "#EXTM3U\n/m/a.mp3\n/m/b.flac\n");
    }

    #[test]
    fn appends_suffix_when_missing() {
        let dir = tempfile::tempdir().expect("temp dir");
        let out = save(&dir.path().join("mix"), &[]).expect("save");
        assert!(out.to_string_lossy().ends_with("mix.m3u"));
        assert!(out.exists());
    }

    #[test]
    fn unwritable_target_is_a_user_error() {
        let missing_dir = Path::new("/definitely/not/here/mix.m3u");
        assert!(matches!(save(missing_dir, &[]), Err(Error::Usage(_))));
    }
}
