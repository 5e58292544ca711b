use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use extensions::{ExtensionContract, ExtensionRegistry, RegistryError};
use inspector::{ExtensionDecl, ImageMetadata, ImageVersion, TypeEntry, write_image};
use types::HostRuntime;

const NETSTANDARD: &str = ".NETStandard,Version=v2.0";
const NETCOREAPP: &str = ".NETCoreApp,Version=v3.1";
const NETFRAMEWORK: &str = ".NETFramework,Version=v4.5";

fn registry() -> ExtensionRegistry {
    ExtensionRegistry::new(HostRuntime::current()).expect("host is supported")
}

fn extension_type(name: &str, interfaces: &[&str], declaration: ExtensionDecl) -> TypeEntry {
    let mut entry = TypeEntry::new(name);
    entry.interfaces = interfaces.iter().map(|i| (*i).to_owned()).collect();
    entry.extension = Some(declaration);
    entry
}

fn listener_image(name: &str, version: ImageVersion, type_name: &str) -> ImageMetadata {
    let mut metadata = ImageMetadata::new(name, NETSTANDARD);
    metadata.version = version;
    metadata.types.push(extension_type(
        type_name,
        &["engine.api.TestEventListener"],
        ExtensionDecl::default(),
    ));
    metadata
}

fn write_plugin(dir: &Path, file_name: &str, metadata: &ImageMetadata) {
    write_image(&dir.join(file_name), metadata, b"").expect("plugin image should write");
}

#[test]
fn discovery_installs_extensions_in_file_order() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    write_plugin(
        dir.path(),
        "a-reporter.gimg",
        &listener_image("a-reporter", ImageVersion::new(1, 0, 0), "a.Reporter"),
    );
    write_plugin(
        dir.path(),
        "b-reporter.gimg",
        &listener_image("b-reporter", ImageVersion::new(1, 0, 0), "b.Reporter"),
    );

    let mut registry = registry();
    registry.discover(dir.path()).expect("discovery should run");

    let type_names: Vec<_> = registry
        .get_extension_nodes("/Engine/TypeExtensions/TestEventListener")
        .map(|node| node.type_name().to_owned())
        .collect();
    assert_eq!(type_names, ["a.Reporter", "b.Reporter"]);
}

#[test]
fn discovery_runs_exactly_once() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let mut registry = registry();
    registry.discover(dir.path()).expect("first run succeeds");
    assert!(matches!(
        registry.discover(dir.path()),
        Err(RegistryError::AlreadyDiscovered)
    ));
}

#[test]
fn addins_manifest_restricts_the_directory() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    write_plugin(
        dir.path(),
        "listed.gimg",
        &listener_image("listed", ImageVersion::new(1, 0, 0), "listed.Reporter"),
    );
    write_plugin(
        dir.path(),
        "unlisted.gimg",
        &listener_image("unlisted", ImageVersion::new(1, 0, 0), "unlisted.Reporter"),
    );
    std::fs::write(
        dir.path().join("host.addins"),
        "# only the listed plugin\nlisted.gimg\n",
    )
    .expect("manifest should write");

    let mut registry = registry();
    registry.discover(dir.path()).expect("discovery should run");

    let type_names: Vec<_> = registry
        .get_extension_nodes("/Engine/TypeExtensions/TestEventListener")
        .map(|node| node.type_name().to_owned())
        .collect();
    assert_eq!(type_names, ["listed.Reporter"]);
}

#[test]
fn manifest_directory_entries_recurse() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let nested = dir.path().join("bundled");
    std::fs::create_dir(&nested).expect("dir should create");
    write_plugin(
        &nested,
        "nested.gimg",
        &listener_image("nested", ImageVersion::new(1, 0, 0), "nested.Reporter"),
    );
    std::fs::write(dir.path().join("host.addins"), "bundled/\n")
        .expect("manifest should write");

    let mut registry = registry();
    registry.discover(dir.path()).expect("discovery should run");
    assert_eq!(
        registry
            .get_extension_nodes("/Engine/TypeExtensions/TestEventListener")
            .count(),
        1
    );
}

#[test]
fn corrupt_wildcard_candidates_are_demoted_to_warnings() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let plugins = dir.path().join("plugins");
    std::fs::create_dir(&plugins).expect("dir should create");
    std::fs::write(plugins.join("broken.gimg"), b"not an image").expect("file should write");
    write_plugin(
        &plugins,
        "ok.gimg",
        &listener_image("ok", ImageVersion::new(1, 0, 0), "ok.Reporter"),
    );
    std::fs::write(dir.path().join("host.addins"), "plugins/*.gimg\n")
        .expect("manifest should write");

    let mut registry = registry();
    registry
        .discover(dir.path())
        .expect("wildcard failures must not abort discovery");
    assert_eq!(
        registry
            .get_extension_nodes("/Engine/TypeExtensions/TestEventListener")
            .count(),
        1
    );
}

#[test]
fn corrupt_explicit_candidates_fail_discovery() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    std::fs::write(dir.path().join("broken.gimg"), b"not an image").expect("file should write");
    std::fs::write(dir.path().join("host.addins"), "broken.gimg\n")
        .expect("manifest should write");

    let mut registry = registry();
    assert!(matches!(
        registry.discover(dir.path()),
        Err(RegistryError::ExtensionLoad { .. })
    ));
}

#[test]
fn duplicate_assemblies_dedupe_to_the_higher_version() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let old_dir = dir.path().join("old");
    let new_dir = dir.path().join("new");
    std::fs::create_dir(&old_dir).expect("dir should create");
    std::fs::create_dir(&new_dir).expect("dir should create");
    write_plugin(
        &old_dir,
        "reporter.gimg",
        &listener_image("reporter", ImageVersion::new(1, 0, 0), "reporter.Listener"),
    );
    write_plugin(
        &new_dir,
        "reporter.gimg",
        &listener_image("reporter", ImageVersion::new(2, 3, 0), "reporter.Listener"),
    );
    std::fs::write(dir.path().join("host.addins"), "old/\nnew/\n")
        .expect("manifest should write");

    let mut registry = registry();
    registry.discover(dir.path()).expect("discovery should run");

    let nodes: Vec<_> = registry
        .get_extension_nodes("/Engine/TypeExtensions/TestEventListener")
        .collect();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].assembly_version(), ImageVersion::new(2, 3, 0));
}

#[test]
fn engine_version_gate_skips_extensions_needing_a_newer_engine() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let mut metadata = ImageMetadata::new("futuristic", NETSTANDARD);
    metadata.types.push(extension_type(
        "futuristic.Reporter",
        &["engine.api.TestEventListener"],
        ExtensionDecl {
            engine_version: Some(ImageVersion::new(9, 0, 0)),
            ..ExtensionDecl::default()
        },
    ));
    write_plugin(dir.path(), "futuristic.gimg", &metadata);

    let mut registry = registry();
    registry.discover(dir.path()).expect("discovery should run");
    assert_eq!(
        registry
            .get_extension_nodes("/Engine/TypeExtensions/TestEventListener")
            .count(),
        0
    );
}

#[test]
fn netcore_host_accepts_core_and_standard_but_not_net_framework() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    for (file_name, target, type_name) in [
        ("core.gimg", NETCOREAPP, "core.Reporter"),
        ("standard.gimg", NETSTANDARD, "standard.Reporter"),
        ("netfx.gimg", NETFRAMEWORK, "netfx.Reporter"),
    ] {
        let mut metadata = ImageMetadata::new(type_name, target);
        metadata.types.push(extension_type(
            type_name,
            &["engine.api.TestEventListener"],
            ExtensionDecl::default(),
        ));
        write_plugin(dir.path(), file_name, &metadata);
    }

    let mut registry = registry();
    registry.discover(dir.path()).expect("discovery should run");

    let type_names: Vec<_> = registry
        .get_extension_nodes("/Engine/TypeExtensions/TestEventListener")
        .map(|node| node.type_name().to_owned())
        .collect();
    assert_eq!(type_names, ["core.Reporter", "standard.Reporter"]);
}

#[test]
fn deduced_path_equals_the_explicit_interface_path() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    write_plugin(
        dir.path(),
        "implicit.gimg",
        &listener_image("implicit", ImageVersion::new(1, 0, 0), "implicit.Reporter"),
    );
    let mut explicit = ImageMetadata::new("explicit", NETSTANDARD);
    explicit.types.push(extension_type(
        "explicit.Reporter",
        &["engine.api.TestEventListener"],
        ExtensionDecl {
            path: Some("/Engine/TypeExtensions/TestEventListener".to_owned()),
            ..ExtensionDecl::default()
        },
    ));
    write_plugin(dir.path(), "explicit.gimg", &explicit);

    let mut registry = registry();
    registry.discover(dir.path()).expect("discovery should run");

    let paths: Vec<_> = registry
        .get_extension_nodes("/Engine/TypeExtensions/TestEventListener")
        .map(|node| node.path().to_owned())
        .collect();
    assert_eq!(paths.len(), 2);
    assert!(paths.iter().all(|p| p == "/Engine/TypeExtensions/TestEventListener"));
}

#[test]
fn deduction_walks_the_base_chain() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let mut metadata = ImageMetadata::new("derived", NETSTANDARD);
    let mut base = TypeEntry::new("derived.ListenerBase");
    base.interfaces = vec!["engine.api.TestEventListener".to_owned()];
    metadata.types.push(base);
    let mut derived = TypeEntry::new("derived.Listener");
    derived.base = Some("derived.ListenerBase".to_owned());
    derived.extension = Some(ExtensionDecl::default());
    metadata.types.push(derived);
    write_plugin(dir.path(), "derived.gimg", &metadata);

    let mut registry = registry();
    registry.discover(dir.path()).expect("discovery should run");
    assert_eq!(
        registry
            .get_extension_nodes("/Engine/TypeExtensions/TestEventListener")
            .count(),
        1
    );
}

#[test]
fn deduction_with_no_matching_point_fails() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let mut metadata = ImageMetadata::new("orphan", NETSTANDARD);
    metadata.types.push(extension_type(
        "orphan.Widget",
        &["orphan.api.Widget"],
        ExtensionDecl::default(),
    ));
    write_plugin(dir.path(), "orphan.gimg", &metadata);

    let mut registry = registry();
    assert!(matches!(
        registry.discover(dir.path()),
        Err(RegistryError::NoExtensionPoint { .. })
    ));
}

#[test]
fn deduction_with_two_matching_interfaces_is_ambiguous() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let mut metadata = ImageMetadata::new("torn", NETSTANDARD);
    metadata.types.push(extension_type(
        "torn.Plugin",
        &["engine.api.TestEventListener", "engine.api.ResultWriter"],
        ExtensionDecl::default(),
    ));
    write_plugin(dir.path(), "torn.gimg", &metadata);

    let mut registry = registry();
    assert!(matches!(
        registry.discover(dir.path()),
        Err(RegistryError::AmbiguousExtensionPoint { .. })
    ));
}

#[test]
fn explicit_path_with_no_point_fails() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let mut metadata = ImageMetadata::new("lost", NETSTANDARD);
    metadata.types.push(extension_type(
        "lost.Plugin",
        &[],
        ExtensionDecl {
            path: Some("/Engine/NoSuchPoint".to_owned()),
            ..ExtensionDecl::default()
        },
    ));
    write_plugin(dir.path(), "lost.gimg", &metadata);

    let mut registry = registry();
    let error = registry
        .discover(dir.path())
        .expect_err("unknown explicit path must fail");
    assert!(matches!(
        error,
        RegistryError::NoExtensionPoint { target } if target == "/Engine/NoSuchPoint"
    ));
}

#[derive(Default)]
struct TeamCityReporter;

impl ExtensionContract for TeamCityReporter {
    const EXPECTED_TYPE: &'static str = "engine.api.TestEventListener";
}

#[test]
fn extensions_materialize_once_and_honor_the_enabled_flag() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    write_plugin(
        dir.path(),
        "teamcity.gimg",
        &listener_image(
            "teamcity",
            ImageVersion::new(1, 0, 0),
            "teamcity.TeamCityReporter",
        ),
    );

    let mut registry = registry();
    registry.register_factory("teamcity.TeamCityReporter", Box::new(|| {
        Arc::new(TeamCityReporter)
    }));
    registry.discover(dir.path()).expect("discovery should run");

    let first: Vec<Arc<TeamCityReporter>> = registry
        .get_extensions::<TeamCityReporter>()
        .collect::<Result<_, _>>()
        .expect("materialization should succeed");
    let second: Vec<Arc<TeamCityReporter>> = registry
        .get_extensions::<TeamCityReporter>()
        .collect::<Result<_, _>>()
        .expect("cached materialization should succeed");
    assert_eq!(first.len(), 1);
    assert!(Arc::ptr_eq(&first[0], &second[0]));

    // Disabling is idempotent and hides the node from retrieval.
    registry.enable_extension("teamcity.TeamCityReporter", false);
    registry.enable_extension("teamcity.TeamCityReporter", false);
    assert_eq!(registry.get_extensions::<TeamCityReporter>().count(), 0);

    registry.enable_extension("teamcity.TeamCityReporter", true);
    registry.enable_extension("teamcity.TeamCityReporter", true);
    assert_eq!(registry.get_extensions::<TeamCityReporter>().count(), 1);
}

#[test]
fn node_properties_survive_discovery() {
    let dir = tempfile::tempdir().expect("tempdir should create");
    let mut metadata = ImageMetadata::new("props", NETSTANDARD);
    let mut properties = BTreeMap::new();
    properties.insert(
        "Format".to_owned(),
        vec!["nunit3".to_owned(), "nunit2".to_owned()],
    );
    metadata.types.push(extension_type(
        "props.Writer",
        &["engine.api.ResultWriter"],
        ExtensionDecl {
            description: Some("writes results".to_owned()),
            properties,
            ..ExtensionDecl::default()
        },
    ));
    write_plugin(dir.path(), "props.gimg", &metadata);

    let mut registry = registry();
    registry.discover(dir.path()).expect("discovery should run");

    let nodes: Vec<_> = registry
        .get_extension_nodes("/Engine/TypeExtensions/ResultWriter")
        .collect();
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].description(), Some("writes results"));
    assert_eq!(nodes[0].property("Format"), ["nunit3", "nunit2"]);
    assert!(nodes[0].property("Absent").is_empty());
}
