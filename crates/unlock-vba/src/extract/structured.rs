use super::{classify, Confidence, ExtractionInput, ModuleDescriptor};
use crate::project::VBAProject;

pub(super) fn extract(input: &ExtractionInput<'_>) -> Option<Vec<ModuleDescriptor>> {
    let bin = input.vba_bin?;
    let project = match VBAProject::parse(bin) {
        Ok(project) => project,
        Err(err) => {
            log::debug!("structured VBA parse unavailable: {err}");
            return None;
        }
    };

    Some(
        project
            .modules
            .into_iter()
            .map(|m| ModuleDescriptor {
                kind: classify(&m.name, &m.code, Some(m.module_type)),
                name: m.name,
                code: m.code,
                confidence: Confidence::Full,
            })
            .collect(),
    )
}
