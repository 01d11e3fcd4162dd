//! Device tree acquisition: a devicetree source (`.dts`/`.its`) parser and compiler, a flattened
//! device tree (`.dtb`/`.itb`) reader, and the read-only [`Document`] both produce.

use std::{fs, path::Path};

use tracing::debug;

pub mod ast;
pub mod compile;
pub mod dtb;
mod error;
pub mod parser;
pub mod tree;

pub use compile::{compile_file, compile_str};
pub use error::Error;
pub use parser::from_str;
pub use tree::{Document, DocumentBuilder, Node, NodeId, Prop, PropertyType};

/// Load a device tree from disk.
///
/// Files starting with the flattened device tree magic are decoded as blobs, anything else is
/// compiled as devicetree source.
pub fn load(path: impl AsRef<Path>) -> Result<Document, Error> {
    let path = path.as_ref();
    let data = fs::read(path).map_err(|e| Error::io(path, e))?;

    if dtb::is_dtb(&data) {
        debug!(path = %path.display(), "loading flattened device tree");
        dtb::parse(&data)
    } else {
        debug!(path = %path.display(), "compiling device tree source");
        compile_file(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_detects_format() {
        let dir = tempfile::tempdir().unwrap();

        let its = dir.path().join("image.its");
        fs::write(&its, "/dts-v1/;\n/ { description = \"source\"; };\n").unwrap();
        let itb = dir.path().join("image.itb");
        fs::write(
            &itb,
            dtb::tests::Writer::default()
                .begin("")
                .prop("description", b"blob\0")
                .end()
                .finish(17),
        )
        .unwrap();

        for (path, desc) in [(its, "source"), (itb, "blob")] {
            let doc = load(&path).unwrap();
            assert_eq!(doc.root().prop("description").unwrap().as_str(), Some(desc));
        }
    }

    #[test]
    fn load_reports_missing_files() {
        let err = load("/nonexistent/image.itb").unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }
}
