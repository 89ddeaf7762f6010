use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use mage_crypto::PresharedKey;
use tracing::info;

use crate::cmd::KeygenArgs;
use crate::exit::{io_error, CliResult, SUCCESS};
use crate::output::{print_key, OutputFormat};

pub fn run(args: KeygenArgs, format: OutputFormat) -> CliResult<i32> {
    let key = PresharedKey::generate();
    let hex_key = key.to_hex();

    match &args.out {
        Some(path) => {
            write_key_file(path, &hex_key, args.force)
                .map_err(|err| io_error(&format!("failed writing {}", path.display()), err))?;
            info!(path = %path.display(), "pre-shared key written");
        }
        None => print_key(&hex_key, format),
    }
    Ok(SUCCESS)
}

fn write_key_file(path: &Path, hex_key: &str, force: bool) -> std::io::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true);
    if force {
        options.create(true).truncate(true);
    } else {
        options.create_new(true);
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(hex_key.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> std::path::PathBuf {
        std::env::temp_dir().join(format!(
            "mage-keygen-{tag}-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .expect("time should be after epoch")
                .as_nanos()
        ))
    }

    #[test]
    fn key_file_roundtrips_and_refuses_overwrite() {
        let path = temp_path("roundtrip");
        let key = PresharedKey::generate();
        write_key_file(&path, &key.to_hex(), false).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(PresharedKey::from_hex(&text).unwrap().as_bytes(), key.as_bytes());

        let err = write_key_file(&path, &key.to_hex(), false).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::AlreadyExists);
        write_key_file(&path, &PresharedKey::generate().to_hex(), true).unwrap();

        let _ = std::fs::remove_file(&path);
    }

    #[cfg(unix)]
    #[test]
    fn key_file_is_private() {
        use std::os::unix::fs::PermissionsExt;

        let path = temp_path("mode");
        write_key_file(&path, &PresharedKey::generate().to_hex(), false).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        let _ = std::fs::remove_file(&path);
    }
}
