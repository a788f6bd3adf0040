use koe::crd::experiment::Experiment;
use kube::CustomResourceExt;

fn main() {
    // Generate the CRD and print as JSON (kubectl accepts JSON)
    let crd = Experiment::crd();
    let json = serde_json::to_string_pretty(&crd).expect("Failed to serialize CRD to JSON");
    println!("{}", json);
}
