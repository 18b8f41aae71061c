//! Firmware archive handling.
//!
//! Release builds are distributed as a zip holding the bootloader, the
//! partition table and the application image. This module unpacks such an
//! archive and works out which file goes to which flash offset, either from
//! an esp-idf `flash_args` file or from well-known file names.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use zip::ZipArchive;

use crate::error::{Error, Result};

/// Default offset for a bare `.bin` image (merged image on ESP32).
pub const DEFAULT_SINGLE_OFFSET: u32 = 0x1000;

/// Directory name used next to the archive when no output is given.
pub const DEFAULT_EXTRACT_DIR: &str = "extracted";

/// Well-known image names and the offsets they are flashed to.
const KNOWN_IMAGES: &[(&str, u32)] = &[
    ("bootloader.bin", 0x1000),
    ("partitions.bin", 0x8000),
    ("partition-table.bin", 0x8000),
    ("boot_app0.bin", 0xE000),
    ("firmware.bin", 0x10000),
    ("app.bin", 0x10000),
];

/// One image to write.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FlashImage {
    /// Flash offset.
    pub offset: u32,
    /// Image file.
    pub path: PathBuf,
}

/// Firmware ready to be handed to the flashing tool.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FirmwareBundle {
    /// Directory the images live in.
    pub root: PathBuf,
    /// Images sorted by offset.
    pub images: Vec<FlashImage>,
}

/// Options for [`prepare_firmware`].
#[derive(Debug, Clone)]
pub struct FirmwareOptions {
    /// Offset for a single `.bin` input or an archive with one unknown image.
    pub single_offset: u32,
    /// Where to unpack archives; defaults to `extracted/` next to the archive.
    pub extract_dir: Option<PathBuf>,
}

impl Default for FirmwareOptions {
    fn default() -> Self {
        Self {
            single_offset: DEFAULT_SINGLE_OFFSET,
            extract_dir: None,
        }
    }
}

/// Turn a firmware input into a list of images.
///
/// Accepts a `.zip` archive, a bare `.bin` image or an already extracted
/// directory.
pub fn prepare_firmware(input: &Path, opts: &FirmwareOptions) -> Result<FirmwareBundle> {
    if input.is_dir() {
        return discover_images(input, opts.single_offset);
    }

    if !input.exists() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} does not exist", input.display()),
        )));
    }

    let ext = input
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);

    match ext.as_deref() {
        Some("zip") => {
            let dest = opts
                .extract_dir
                .clone()
                .unwrap_or_else(|| default_extract_dir(input));
            // Only what this archive wrote; `dest` may hold an older release.
            let files = extract_zip(input, &dest)?;
            layout_from_files(&dest, &files, opts.single_offset)
        },
        Some("bin") => {
            let root = input
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_default();
            Ok(FirmwareBundle {
                root,
                images: vec![FlashImage {
                    offset: opts.single_offset,
                    path: input.to_path_buf(),
                }],
            })
        },
        _ => Err(Error::Firmware(format!(
            "{}: expected a .zip archive or a .bin image",
            input.display()
        ))),
    }
}

/// `extracted/` beside the archive.
pub fn default_extract_dir(archive: &Path) -> PathBuf {
    archive
        .parent()
        .map_or_else(|| PathBuf::from(DEFAULT_EXTRACT_DIR), |p| p.join(DEFAULT_EXTRACT_DIR))
}

/// Unpack a zip archive into `dest`, returning the files written.
///
/// Entries whose names would land outside `dest` are skipped.
pub fn extract_zip(archive_path: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    info!("Extracting {} to {}", archive_path.display(), dest.display());
    fs::create_dir_all(dest)?;

    let file = fs::File::open(archive_path)?;
    let mut archive = ZipArchive::new(file)?;
    let mut written = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!("Skipping unsafe archive entry: {}", entry.name());
            continue;
        };
        let out_path = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = fs::File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
        debug!("Extracted {}", out_path.display());
        written.push(out_path);
    }

    Ok(written)
}

/// Work out the image layout of a directory.
///
/// A `flash_args` file wins; otherwise images are matched by name. A
/// directory holding exactly one unknown `.bin` is treated as a merged image.
pub fn discover_images(root: &Path, single_offset: u32) -> Result<FirmwareBundle> {
    let files = list_files(root)?;
    layout_from_files(root, &files, single_offset)
}

/// [`discover_images`] restricted to `files`, e.g. the output of [`extract_zip`].
pub fn layout_from_files(
    root: &Path,
    files: &[PathBuf],
    single_offset: u32,
) -> Result<FirmwareBundle> {
    let mut files = files.to_vec();
    files.sort();

    if let Some(args) = files
        .iter()
        .find(|p| p.file_name().is_some_and(|n| n == "flash_args"))
    {
        let base = args.parent().unwrap_or(root);
        let content = fs::read_to_string(args)?;
        let images = parse_flash_args(&content, base)?;
        if !images.is_empty() {
            debug!("Using layout from {}", args.display());
            return Ok(FirmwareBundle {
                root: root.to_path_buf(),
                images,
            });
        }
    }

    let mut images: Vec<FlashImage> = Vec::new();
    for (name, offset) in KNOWN_IMAGES {
        if images.iter().any(|img| img.offset == *offset) {
            continue;
        }
        if let Some(path) = files.iter().find(|p| file_name_lower(p) == *name) {
            images.push(FlashImage {
                offset: *offset,
                path: path.clone(),
            });
        }
    }

    if images.is_empty() {
        let bins: Vec<&PathBuf> = files
            .iter()
            .filter(|p| file_name_lower(p).ends_with(".bin"))
            .collect();
        if let [only] = bins.as_slice() {
            images.push(FlashImage {
                offset: single_offset,
                path: (*only).clone(),
            });
        }
    }

    if images.is_empty() {
        return Err(Error::Firmware(format!(
            "no flashable images found in {}",
            root.display()
        )));
    }

    images.sort_by_key(|img| img.offset);
    Ok(FirmwareBundle {
        root: root.to_path_buf(),
        images,
    })
}

/// Parse an esp-idf `flash_args` file.
///
/// Lines of the form `0x1000 bootloader/bootloader.bin` are images, relative
/// to `base`; option lines are ignored.
pub fn parse_flash_args(content: &str, base: &Path) -> Result<Vec<FlashImage>> {
    let mut images = Vec::new();

    for line in content.lines().map(str::trim) {
        let Some(rest) = line
            .strip_prefix("0x")
            .or_else(|| line.strip_prefix("0X"))
        else {
            continue;
        };
        let mut parts = rest.split_whitespace();
        let (Some(hex), Some(file)) = (parts.next(), parts.next()) else {
            return Err(Error::Firmware(format!("bad flash_args line: {line:?}")));
        };
        let offset = u32::from_str_radix(hex, 16)
            .map_err(|e| Error::Firmware(format!("bad offset in {line:?}: {e}")))?;
        images.push(FlashImage {
            offset,
            path: base.join(file),
        });
    }

    images.sort_by_key(|img| img.offset);
    Ok(images)
}

fn file_name_lower(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

/// All files below `root`, in a stable order.
fn list_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries: Vec<PathBuf> = fs::read_dir(&dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .collect();
        entries.sort();
        for path in entries {
            if path.is_dir() {
                pending.push(path);
            } else {
                out.push(path);
            }
        }
    }

    out.sort();
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn write_zip(path: &Path, entries: &[(&str, &[u8])]) {
        let file = fs::File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        for (name, data) in entries {
            zip.start_file(*name, options).unwrap();
            zip.write_all(data).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_parse_flash_args() {
        let content = "--flash_mode dio --flash_freq 40m --flash_size 4MB\n\
                       0x1000 bootloader/bootloader.bin\n\
                       0x10000 app.bin\n\
                       0x8000 partition_table/partition-table.bin\n";
        let images = parse_flash_args(content, Path::new("/fw")).unwrap();
        assert_eq!(images.len(), 3);
        assert_eq!(images[0].offset, 0x1000);
        assert_eq!(images[0].path, Path::new("/fw/bootloader/bootloader.bin"));
        assert_eq!(images[1].offset, 0x8000);
        assert_eq!(images[2].offset, 0x10000);
    }

    #[test]
    fn test_parse_flash_args_bad_offset() {
        let err = parse_flash_args("0xZZ app.bin\n", Path::new(".")).unwrap_err();
        assert!(matches!(err, Error::Firmware(_)));
    }

    #[test]
    fn test_parse_flash_args_missing_file() {
        assert!(parse_flash_args("0x1000\n", Path::new(".")).is_err());
    }

    #[test]
    fn test_discover_known_names() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["firmware.bin", "bootloader.bin", "partitions.bin", "readme.txt"] {
            fs::write(dir.path().join(name), b"x").unwrap();
        }

        let bundle = discover_images(dir.path(), DEFAULT_SINGLE_OFFSET).unwrap();
        let offsets: Vec<u32> = bundle.images.iter().map(|i| i.offset).collect();
        assert_eq!(offsets, vec![0x1000, 0x8000, 0x10000]);
        assert!(bundle.images[2].path.ends_with("firmware.bin"));
    }

    #[test]
    fn test_discover_single_unknown_bin() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("merged-v1.2.bin"), b"x").unwrap();

        let bundle = discover_images(dir.path(), 0x0).unwrap();
        assert_eq!(bundle.images.len(), 1);
        assert_eq!(bundle.images[0].offset, 0x0);
    }

    #[test]
    fn test_discover_empty_dir_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = discover_images(dir.path(), DEFAULT_SINGLE_OFFSET).unwrap_err();
        assert!(matches!(err, Error::Firmware(_)));
    }

    #[test]
    fn test_discover_prefers_flash_args() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("build")).unwrap();
        fs::write(dir.path().join("build/app.bin"), b"x").unwrap();
        fs::write(dir.path().join("build/flash_args"), "0x20000 app.bin\n").unwrap();

        let bundle = discover_images(dir.path(), DEFAULT_SINGLE_OFFSET).unwrap();
        assert_eq!(bundle.images.len(), 1);
        assert_eq!(bundle.images[0].offset, 0x20000);
        assert_eq!(bundle.images[0].path, dir.path().join("build/app.bin"));
    }

    #[test]
    fn test_prepare_zip_extracts_next_to_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("release.zip");
        write_zip(
            &archive,
            &[
                ("bootloader.bin", b"boot"),
                ("nested/partitions.bin", b"parts"),
                ("firmware.bin", b"app"),
            ],
        );

        let bundle = prepare_firmware(&archive, &FirmwareOptions::default()).unwrap();
        assert_eq!(bundle.root, dir.path().join("extracted"));
        assert_eq!(bundle.images.len(), 3);
        assert_eq!(
            fs::read(dir.path().join("extracted/nested/partitions.bin")).unwrap(),
            b"parts"
        );
    }

    #[test]
    fn test_prepare_zip_into_explicit_dir() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("fw.ZIP");
        write_zip(&archive, &[("firmware.bin", b"app")]);
        let out = dir.path().join("out");

        let opts = FirmwareOptions {
            extract_dir: Some(out.clone()),
            ..Default::default()
        };
        let bundle = prepare_firmware(&archive, &opts).unwrap();
        assert_eq!(bundle.root, out);
        assert_eq!(bundle.images[0].offset, 0x10000);
    }

    #[test]
    fn test_prepare_zip_ignores_previous_extraction() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.zip");
        write_zip(
            &old,
            &[
                ("bootloader.bin", b"boot"),
                ("partitions.bin", b"parts"),
                ("firmware.bin", b"app v1"),
            ],
        );
        let new = dir.path().join("new.zip");
        write_zip(&new, &[("firmware.bin", b"app v2")]);

        let first = prepare_firmware(&old, &FirmwareOptions::default()).unwrap();
        assert_eq!(first.images.len(), 3);

        let second = prepare_firmware(&new, &FirmwareOptions::default()).unwrap();
        assert_eq!(
            second.images,
            vec![FlashImage {
                offset: 0x10000,
                path: dir.path().join("extracted/firmware.bin"),
            }]
        );
        assert_eq!(
            fs::read(dir.path().join("extracted/firmware.bin")).unwrap(),
            b"app v2"
        );
    }

    #[test]
    fn test_layout_from_files_uses_only_listed_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("bootloader.bin"), b"stale").unwrap();
        fs::write(dir.path().join("app.bin"), b"app").unwrap();

        let bundle = layout_from_files(
            dir.path(),
            &[dir.path().join("app.bin")],
            DEFAULT_SINGLE_OFFSET,
        )
        .unwrap();
        assert_eq!(bundle.images.len(), 1);
        assert_eq!(bundle.images[0].offset, 0x10000);
    }

    #[test]
    fn test_extract_zip_skips_escaping_entries() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("evil.zip");
        write_zip(&archive, &[("../escape.bin", b"x"), ("ok.bin", b"y")]);
        let out = dir.path().join("out");

        let written = extract_zip(&archive, &out).unwrap();
        assert_eq!(written, vec![out.join("ok.bin")]);
        assert!(!dir.path().join("escape.bin").exists());
    }

    #[test]
    fn test_prepare_bare_bin() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("app.bin");
        fs::write(&bin, b"x").unwrap();

        let bundle = prepare_firmware(&bin, &FirmwareOptions::default()).unwrap();
        assert_eq!(
            bundle.images,
            vec![FlashImage {
                offset: DEFAULT_SINGLE_OFFSET,
                path: bin
            }]
        );
    }

    #[test]
    fn test_prepare_rejects_unknown_extension() {
        let dir = tempfile::tempdir().unwrap();
        let elf = dir.path().join("firmware.elf");
        fs::write(&elf, b"x").unwrap();
        assert!(matches!(
            prepare_firmware(&elf, &FirmwareOptions::default()),
            Err(Error::Firmware(_))
        ));
    }

    #[test]
    fn test_prepare_missing_input() {
        let err = prepare_firmware(Path::new("/nonexistent/fw.zip"), &FirmwareOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
