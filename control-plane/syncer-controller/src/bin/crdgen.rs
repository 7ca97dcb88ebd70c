use kube::core::CustomResourceExt;
use syncer_models::SyncSource;

fn main() {
    let crd = SyncSource::crd();
    match serde_yaml::to_string(&crd) {
        Ok(yaml) => println!("{}", yaml),
        Err(e) => {
            eprintln!("failed to serialize CRD: {e}");
            std::process::exit(1);
        }
    }
}
