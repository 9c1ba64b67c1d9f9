use devsecops_stack::declaration::StackDeclaration;
use devsecops_stack::presets::{generate_preset, preset, preset_names};
use devsecops_stack::validation::validate_stack;
use std::fs;
use tempfile::tempdir;

#[test]
fn generate_reference_preset_writes_file() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("stacks/devsecops.yaml");
    let generated = generate_preset("devsecops-eks", &path).expect("preset generation");
    assert!(generated.exists());
    let contents = fs::read_to_string(&generated).expect("read preset");
    assert!(contents.contains("kind: approval"));
    assert!(contents.contains("http_tokens: required"));
    assert!(contents.contains("parameter: KubectlRelease"));
}

#[test]
fn generated_presets_load_back_and_validate() {
    let temp = tempdir().unwrap();
    for name in preset_names() {
        let path = temp.path().join(format!("{name}.yaml"));
        generate_preset(name, &path).unwrap();
        let loaded = StackDeclaration::load(&path).unwrap();
        assert_eq!(loaded, preset(name).unwrap(), "{name}");
        let report = validate_stack(&loaded);
        assert!(report.is_ok(), "{name}: {:#?}", report.errors);
    }
}

#[test]
fn unknown_preset_is_rejected() {
    let temp = tempdir().unwrap();
    let err = generate_preset("gke", &temp.path().join("gke.yaml")).unwrap_err();
    assert!(err.to_string().contains("Unknown preset 'gke'"));
}
