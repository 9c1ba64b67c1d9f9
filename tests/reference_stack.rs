use std::path::PathBuf;

use devsecops_stack::declaration::StackDeclaration;
use devsecops_stack::presets::preset;
use devsecops_stack::synth::synthesize;
use devsecops_stack::validation::validate_stack;

fn reference_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("stacks/devsecops-eks.yaml")
}

#[test]
fn checked_in_declaration_matches_preset() {
    let loaded = StackDeclaration::load(&reference_path()).unwrap();
    assert_eq!(loaded, preset("devsecops-eks").unwrap());
}

#[test]
fn checked_in_declaration_is_clean() {
    let loaded = StackDeclaration::load(&reference_path()).unwrap();
    let report = validate_stack(&loaded);
    assert!(report.is_ok(), "{:#?}", report.errors);
    assert!(report.warnings.is_empty(), "{:#?}", report.warnings);
}

#[test]
fn reference_template_exports_names() {
    let graph = synthesize(&preset("devsecops-eks").unwrap()).unwrap();
    let template = graph.to_template();
    let outputs = template["Outputs"].as_object().unwrap();
    let exports: Vec<&str> = outputs
        .values()
        .map(|output| output["Export"]["Name"].as_str().unwrap())
        .collect();
    for expected in [
        "EKSClusterName",
        "ECRrepo",
        "CCrepo",
        "CPName",
        "StaticScanProject",
        "EKSDeployProject",
        "CheckovProject",
    ] {
        assert!(exports.contains(&expected), "missing export {expected}");
    }
}

#[test]
fn custom_image_pool_uses_hardened_template() {
    let graph = synthesize(&preset("devsecops-eks").unwrap()).unwrap();
    let template = &graph.resources["HardenedNodeTemplateLaunchTemplate"];
    let metadata = &template.properties["LaunchTemplateData"]["MetadataOptions"];
    assert_eq!(metadata["HttpTokens"], "required");
    assert_eq!(metadata["HttpPutResponseHopLimit"], 1);

    let pool = &graph.resources["ExtraNgWithLtNodegroup"];
    assert!(pool.references().contains("HardenedNodeTemplateLaunchTemplate"));
}
