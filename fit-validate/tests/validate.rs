use std::{fs, path::PathBuf, sync::Arc};

use fit_validate::{fit_schema, Element, Schema, ValidationError, Validator, Variant};
use tempfile::TempDir;

const HEADER: &str = r#"/dts-v1/;

/ {
    timestamp = <123456>;
    description = "This is my description";
    #address-cells = <1>;
    images {
        image-1 {
            description = "Image description";
            arch = "arm64";
            type = "kernel";
            data = "abc";
            os = "linux";
            project = "linux";
        };
    };

    configurations {
        config-1 {
            description = "Configuration description";
            firmware = "image-1";
        };
    };
};
"#;

const EXTRA: &str = r#"
/ {
    wibble {
        something;
    };

    images {
        extra-prop;
    };
};
"#;

const FIT: &str = r#"/dts-v1/;

/ {
    timestamp = <0x65a1b2c3>;
    description = "Linux with a device tree";
    #address-cells = <1>;

    images {
        kernel-1 {
            description = "Kernel";
            data = /incbin/("kernel.bin");
            type = "kernel";
            arch = "arm64";
            os = "linux";
            compression = "none";
            load = <0x80080000>;
            entry = <0x80080000>;
        };
        fdt-1 {
            description = "Device tree";
            data-offset = <0x1000>;
            data-size = <0x200>;
            type = "flat_dt";
            arch = "arm64";
            os = "linux";
        };
    };

    configurations {
        default = "conf-1";
        conf-1 {
            description = "Boot Linux";
            kernel = "kernel-1";
            fdt = "fdt-1";
            loadables = "kernel-1", "fdt-1";
        };
    };
};
"#;

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("kernel.bin"), [0xaau8; 64]).unwrap();
        Self { dir }
    }

    fn write(&self, name: &str, source: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        fs::write(&path, source).unwrap();
        path
    }
}

fn validator(variant: Variant) -> Validator {
    Validator::new(Arc::new(fit_schema(variant).unwrap()), false)
}

fn run(variant: Variant, source: &str) -> Vec<String> {
    let fixture = Fixture::new();
    let path = fixture.write("image.its", source);
    validator(variant)
        .start(&path)
        .unwrap()
        .iter()
        .map(ToString::to_string)
        .collect()
}

#[test]
fn base() {
    assert!(run(Variant::Upl, HEADER).is_empty());
    assert!(run(Variant::Fit, FIT).is_empty());
}

#[test]
fn missing_variant_fields() {
    let source: String = HEADER
        .lines()
        .filter(|l| !l.contains("project") && !l.contains("firmware"))
        .map(|l| format!("{l}\n"))
        .collect();

    assert_eq!(
        run(Variant::Upl, &source),
        [
            "/images/image-1: Required property 'project' missing",
            "/configurations/config-1: Required property 'firmware' missing",
        ]
    );
}

#[test]
fn extra() {
    let source = format!("{HEADER}{EXTRA}");
    assert_eq!(
        run(Variant::Upl, &source),
        [
            "/images: Unexpected property 'extra-prop', valid list is ()",
            "/: Unexpected subnode 'wibble', valid list is (images, configurations)",
        ]
    );
}

#[test]
fn variants_differ() {
    let errors = run(Variant::Fit, HEADER);
    assert_eq!(
        errors,
        [
            "/images/image-1: Unexpected property 'project', valid list is (description, \
             timestamp, arch, type, compression, data, os, load, capabilities, producer, \
             uncomp-size, entry-start, entry, reloc-start)",
            "/configurations/config-1: Node name 'config-1' does not match pattern '^conf-\\d+$'",
            "/configurations/config-1: Unexpected property 'firmware', valid list is (description, \
             fdt, loadables, compatible, require-fit, kernel, ramdisk)",
            "/configurations/config-1: Required property 'kernel' missing",
        ]
    );
}

#[test]
fn data_alternatives() {
    for (replacement, expected) in [
        ("data = \"abc\";", vec![]),
        ("data-offset = <0>; data-size = <3>;", vec![]),
        (
            "data-offset = <0>;",
            vec!["/images/image-1: Required property 'data-size' missing"],
        ),
        (
            "",
            vec![
                "/images/image-1: Required property 'data-offset' missing",
                "/images/image-1: Required property 'data-size' missing",
                "/images/image-1: Required property 'data' missing",
            ],
        ),
    ] {
        let source = HEADER.replace("data = \"abc\";", replacement);
        assert_eq!(run(Variant::Upl, &source), expected, "with '{replacement}'");
    }
}

#[test]
fn value_checks() {
    let source = HEADER
        .replace("#address-cells = <1>;", "#address-cells = <3>;")
        .replace("timestamp = <123456>;", "timestamp = <1 2>;");

    assert_eq!(
        run(Variant::Upl, &source),
        [
            "/: 'timestamp' value '<0x1 0x2>' must be a u32",
            "/: '#address-cells' value '3' must be 1 or 2",
        ]
    );
}

#[test]
fn unpatterned_strings_take_any_value() {
    let source = FIT
        .replace(
            "description = \"Linux with a device tree\";",
            "description = \"\";",
        )
        .replace("fdt = \"fdt-1\";", "fdt = \"fdt-1\", \"overlay-1\";");
    assert!(source.contains("description = \"\";"));
    assert!(source.contains("\"overlay-1\""));

    assert!(run(Variant::Fit, &source).is_empty());
}

#[test]
fn phandle_targets() {
    let schema = Schema::new(Element::node(
        "/",
        vec![
            Element::node(
                "images",
                vec![Element::any_node(r"image-\d+", vec![Element::phandle_target()])],
            ),
            Element::node(
                "configurations",
                vec![Element::any_node(
                    "",
                    vec![Element::phandle("firmware", "/images/ANY")],
                )],
            ),
        ],
    ))
    .unwrap();
    let mut validator = Validator::new(Arc::new(schema), false);

    let doc = dtree::compile_str(
        r#"/dts-v1/;
        / {
            images { fw: image-1 { }; };
            configurations {
                good { firmware = <&fw>; };
                bad { firmware = <&cfg>; };
                dangling { firmware = <7>; };
            };
            cfg: other { };
        };"#,
        ".",
    )
    .unwrap();

    let errors: Vec<_> = validator
        .validate(&doc)
        .unwrap()
        .iter()
        .map(ToString::to_string)
        .collect();
    assert_eq!(
        errors,
        [
            "/configurations/bad: Phandle 'firmware' targets node '/other' which does not \
             match pattern '/images/ANY'",
            "/configurations/dangling: Phandle 'firmware' value '<0x7>' does not reference a node",
            "/: Unexpected subnode 'other', valid list is (images, configurations)",
        ]
    );
}

#[test]
fn raise_on_error() {
    let fixture = Fixture::new();
    let path = fixture.write("extra.its", &format!("{HEADER}{EXTRA}"));
    let mut validator = Validator::new(Arc::new(fit_schema(Variant::Upl).unwrap()), true);

    match validator.start(&path) {
        Err(ValidationError::Aborted(finding)) => assert_eq!(
            finding.to_string(),
            "/images: Unexpected property 'extra-prop', valid list is ()"
        ),
        other => panic!("expected an abort, got {other:?}"),
    }
}

#[test]
fn runs_reset_state() {
    let fixture = Fixture::new();
    let bad = fixture.write("bad.its", &format!("{HEADER}{EXTRA}"));
    let good = fixture.write("good.its", HEADER);
    let mut validator = validator(Variant::Upl);

    assert_eq!(validator.start(&bad).unwrap().len(), 2);
    assert!(validator.start(&good).unwrap().is_empty());
    assert!(validator.errors().is_empty());
}

#[test]
fn load_failures() {
    let fixture = Fixture::new();
    let mut validator = validator(Variant::Upl);

    let missing = fixture.dir.path().join("missing.its");
    assert!(matches!(
        validator.start(&missing),
        Err(ValidationError::Load {
            source: dtree::Error::Io { .. },
            ..
        })
    ));

    let broken = fixture.write("broken.its", "/dts-v1/;\n/ {\n    oops = <1;\n};\n");
    match validator.start(&broken) {
        Err(ValidationError::Load {
            source: dtree::Error::Syntax { line, .. },
            path,
        }) => {
            assert_eq!(line, 3);
            assert_eq!(path, broken);
        }
        other => panic!("expected a syntax error, got {other:?}"),
    }
}
