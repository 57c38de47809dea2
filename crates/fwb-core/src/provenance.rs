use std::{fs, io, path::Path};

use serde::Serialize;

pub const PROVENANCE_FILE: &str = "provenance.txt";

/// Where an installed toolchain came from.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Provenance {
    pub version: String,
    pub target: String,
    pub archive_url: String,
    pub sha256: String,
    pub signing_key_id: String,
    pub upstream_modified_unix_millis: i64,
    pub installed_at_unix_millis: i64,
}

pub(crate) fn write_provenance(dir: &Path, prov: &Provenance) -> io::Result<()> {
    let mut contents = format!(
        "version={}\ntarget={}\narchive_url={}\nsha256={}\ninstalled_at_unix_millis={}\n",
        prov.version, prov.target, prov.archive_url, prov.sha256, prov.installed_at_unix_millis
    );
    if !prov.signing_key_id.is_empty() {
        contents.push_str(&format!("signing_key_id={}\n", prov.signing_key_id));
    }
    if prov.upstream_modified_unix_millis > 0 {
        contents.push_str(&format!(
            "upstream_modified_unix_millis={}\n",
            prov.upstream_modified_unix_millis
        ));
    }
    fs::write(dir.join(PROVENANCE_FILE), contents)
}

fn parse_provenance(contents: &str) -> Provenance {
    let mut prov = Provenance::default();
    for line in contents.lines() {
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "version" => prov.version = value.to_string(),
            "target" => prov.target = value.to_string(),
            "archive_url" => prov.archive_url = value.to_string(),
            "sha256" => prov.sha256 = value.to_string(),
            "signing_key_id" => prov.signing_key_id = value.to_string(),
            "upstream_modified_unix_millis" => {
                if let Ok(parsed) = value.parse::<i64>() {
                    prov.upstream_modified_unix_millis = parsed;
                }
            }
            "installed_at_unix_millis" => {
                if let Ok(parsed) = value.parse::<i64>() {
                    prov.installed_at_unix_millis = parsed;
                }
            }
            _ => {}
        }
    }
    prov
}

pub(crate) fn read_provenance(path: &Path) -> io::Result<Provenance> {
    let contents = fs::read_to_string(path)?;
    Ok(parse_provenance(&contents))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_keeps_fields() {
        let dir = tempfile::tempdir().unwrap();
        let prov = Provenance {
            version: "23.05.0".into(),
            target: "ath79/generic".into(),
            archive_url: "https://example.org/ib.tar.xz".into(),
            sha256: "ab".repeat(32),
            signing_key_id: "b5043e70f9a75cde".into(),
            upstream_modified_unix_millis: 1_700_000_000_000,
            installed_at_unix_millis: 1_700_000_100_000,
        };
        write_provenance(dir.path(), &prov).unwrap();
        assert_eq!(read_provenance(&dir.path().join(PROVENANCE_FILE)).unwrap(), prov);
    }

    #[test]
    fn unknown_and_malformed_lines_are_skipped() {
        let prov = parse_provenance("version=SNAPSHOT\nnoise\nextra=1\ninstalled_at_unix_millis=x\n");
        assert_eq!(prov.version, "SNAPSHOT");
        assert_eq!(prov.installed_at_unix_millis, 0);
    }
}
