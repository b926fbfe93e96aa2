//! Loading the board, tools, libraries and sketch, and assembling the build
//! properties from them.

use super::context::Context;
use crate::fqbn::Fqbn;
use crate::hardware::{Hardware, discover_tools};
use crate::library::{LibraryIndex, LibraryLocation};
use crate::properties::{PropertyMap, host_os};
use crate::sketch::Sketch;
use anyhow::{Context as _, Result, bail};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

pub const IDE_VERSION: &str = "10607";
pub const SOFTWARE: &str = "ARDUINO";

const DEFAULT_WARNING_FLAGS: [(&str, &str); 5] = [
    ("compiler.warning_flags", ""),
    ("compiler.warning_flags.none", ""),
    ("compiler.warning_flags.default", ""),
    ("compiler.warning_flags.more", "-Wall"),
    ("compiler.warning_flags.all", "-Wall -Wextra"),
];

pub fn load_hardware(ctx: &mut Context) -> Result<()> {
    let fqbn = Fqbn::parse(&ctx.fqbn)?;
    let hardware = Hardware::load(&ctx.hardware_dirs)?;
    let target = hardware.resolve(&fqbn)?;
    debug!(
        "Board {} from {}, core {}",
        fqbn,
        target.platform_dir.display(),
        target.core_dir.display()
    );
    ctx.target = Some(target);
    Ok(())
}

pub fn load_sketch(ctx: &mut Context) -> Result<()> {
    ctx.sketch = Some(Sketch::load(&ctx.sketch_location)?);
    Ok(())
}

/// Index libraries from every root, tagged with their location tier.
pub fn load_libraries(ctx: &mut Context) -> Result<()> {
    let target = ctx.target()?;
    let mut roots = vec![(target.platform_libraries_dir(), LibraryLocation::PlatformBuiltIn)];
    if let Some(dir) = target.referenced_libraries_dir() {
        roots.push((dir, LibraryLocation::ReferencedPlatformBuiltIn));
    }
    roots.extend(
        ctx.other_libraries_dirs
            .iter()
            .map(|d| (d.clone(), LibraryLocation::User)),
    );
    roots.extend(
        ctx.builtin_libraries_dirs
            .iter()
            .map(|d| (d.clone(), LibraryLocation::IdeBuiltIn)),
    );
    ctx.library_index = LibraryIndex::scan(&roots)?;
    debug!("Indexed {} libraries", ctx.library_index.libraries().len());
    Ok(())
}

/// Parse `key=value` overrides given on the command line.
pub fn parse_custom_properties(entries: &[String]) -> Result<PropertyMap> {
    let mut properties = PropertyMap::new();
    for entry in entries {
        let Some((key, value)) = entry.split_once('=') else {
            bail!("Invalid build property '{entry}', expected key=value");
        };
        properties.set(key.trim(), value.trim());
    }
    Ok(properties)
}

/// Platform and board properties, then runtime keys, then the user's
/// overrides.
pub fn setup_build_properties(ctx: &mut Context) -> Result<()> {
    let target = ctx.target()?;
    let sketch = ctx.sketch()?;
    let mut properties = target.properties.clone();

    properties.set_path("build.core.path", &target.core_dir);
    properties.set_path("build.system.path", &target.core_platform_dir().join("system"));
    match &target.variant_dir {
        Some(dir) => properties.set_path("build.variant.path", dir),
        None => properties.set("build.variant.path", ""),
    }
    properties.set_path("runtime.platform.path", &target.platform_dir);
    properties.set_path("runtime.hardware.path", &target.hardware_dir());
    properties.set("runtime.ide.version", IDE_VERSION);
    properties.set("ide_version", IDE_VERSION);
    properties.set("runtime.os", host_os());
    properties.set("build.fqbn", target.fqbn.to_string());
    properties.set("build.arch", target.fqbn.architecture.to_uppercase());
    properties.set("software", SOFTWARE);
    properties.set("build.library_discovery_phase", "0");
    properties.set_path("build.source.path", &sketch.full_path);

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .context("System clock is before 1970")?
        .as_secs()
        .to_string();
    properties.set("extra.time.utc", now.clone());
    properties.set("extra.time.local", now);

    properties.merge(&discover_tools(&ctx.tools_dirs)?);
    properties.set_path("build.path", &ctx.build_path);
    properties.set("build.project_name", sketch.main_file_name());

    for (key, value) in DEFAULT_WARNING_FLAGS {
        if !properties.contains_key(key) {
            properties.set(key, value);
        }
    }

    properties.merge(&parse_custom_properties(&ctx.custom_build_properties)?);
    ctx.build_properties = properties;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::path::Path;
    use tempfile::TempDir;

    fn write(path: &Path, content: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn context(tmp: &TempDir) -> Context {
        let root = tmp.path();
        write(
            &root.join("hardware/acme/avr/platform.txt"),
            "name=Acme\ncompiler.optimization_flags=-Os\ncompiler.warning_flags.all=-Wall -Wextra -Werror\n",
        );
        write(
            &root.join("hardware/acme/avr/boards.txt"),
            "uno.name=Uno\nuno.build.core=arduino\nuno.build.variant=standard\nuno.build.mcu=atmega328p\n",
        );
        fs::create_dir_all(root.join("hardware/acme/avr/cores/arduino")).unwrap();
        write(&root.join("hardware/acme/avr/libraries/EEPROM/EEPROM.h"), "");
        write(&root.join("user/Servo/Servo.h"), "");
        fs::create_dir_all(root.join("tools/avr-gcc/7.3.0")).unwrap();
        write(&root.join("Blink/Blink.ino"), "void setup() {}\nvoid loop() {}\n");

        let mut ctx = Context::new(root.join("Blink"), "acme:avr:uno", root.join("build"));
        ctx.hardware_dirs = vec![root.join("hardware")];
        ctx.tools_dirs = vec![root.join("tools")];
        ctx.other_libraries_dirs = vec![root.join("user")];
        ctx.custom_build_properties = vec!["build.mcu=atmega2560".into()];
        ctx
    }

    #[test]
    fn test_setup_build_properties() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = context(&tmp);
        load_hardware(&mut ctx).unwrap();
        load_sketch(&mut ctx).unwrap();
        setup_build_properties(&mut ctx).unwrap();

        let props = &ctx.build_properties;
        assert_eq!(props.get("build.arch"), "AVR");
        assert_eq!(props.get("build.fqbn"), "acme:avr:uno");
        assert_eq!(props.get("build.project_name"), "Blink.ino");
        assert_eq!(props.get("build.mcu"), "atmega2560");
        assert_eq!(props.get("compiler.warning_flags.all"), "-Wall -Wextra -Werror");
        assert_eq!(props.get("compiler.warning_flags.more"), "-Wall");
        assert!(props.get("build.variant.path").ends_with("standard"));
        assert!(props.get("runtime.tools.avr-gcc-7.3.0.path").ends_with("7.3.0"));
        assert_eq!(props.get("build.path"), tmp.path().join("build").to_string_lossy());
        assert!(!props.get("extra.time.utc").is_empty());
    }

    #[test]
    fn test_load_libraries_tiers() {
        let tmp = TempDir::new().unwrap();
        let mut ctx = context(&tmp);
        load_hardware(&mut ctx).unwrap();
        load_libraries(&mut ctx).unwrap();
        let libs = ctx.library_index.libraries();
        assert_eq!(libs.len(), 2);
        assert_eq!(libs[0].name, "EEPROM");
        assert_eq!(libs[0].location, LibraryLocation::PlatformBuiltIn);
        assert_eq!(libs[1].location, LibraryLocation::User);
    }

    #[test]
    fn test_parse_custom_properties() {
        let props = parse_custom_properties(&["a=1".into(), "b = x=y".into()]).unwrap();
        assert_eq!(props.get("a"), "1");
        assert_eq!(props.get("b"), "x=y");
        assert!(parse_custom_properties(&["novalue".into()]).is_err());
    }
}
