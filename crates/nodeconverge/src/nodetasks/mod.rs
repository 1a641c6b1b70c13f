//! Built-in task kinds for converging a node.

use nodeconverge_macros::Catalog;

use crate::error::Result;
use crate::task::TaskRegistry;

pub mod file;
pub mod load_image;

pub use file::File;
pub use load_image::LoadImage;

#[Catalog(id = "nodetasks", tasks = [File, LoadImage])]
pub struct NodeTasks;

/// Registry holding every built-in kind.
pub fn builtin_registry() -> Result<TaskRegistry> {
    let mut reg = TaskRegistry::default();
    reg.register(&NodeTasks)?;
    Ok(reg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigDoc;
    use crate::error::Error;
    use crate::task::Catalog;

    #[test]
    fn catalog_lists_and_registers_its_kinds() {
        assert_eq!(NodeTasks.id(), "nodetasks");
        assert_eq!(NodeTasks.kinds(), vec!["file", "load_image"]);
        let reg = builtin_registry().expect("registry");
        assert_eq!(reg.kinds().collect::<Vec<_>>(), vec!["file", "load_image"]);
    }

    #[test]
    fn declarations_build_or_explain_why_not() {
        let doc = ConfigDoc::parse(
            "<mem>",
            r#"
[[tasks]]
id = "kubelet-conf"
kind = "file"
path = "/etc/kubernetes/kubelet.conf"
contents = "x"

[[tasks]]
id = "typo"
kind = "file"
path = "/etc/x"
content = "x"

[[tasks]]
id = "mystery"
kind = "sysctl"
"#,
        )
        .expect("parse");
        let cfg = doc.run_config().expect("cfg");
        let reg = builtin_registry().expect("registry");

        let task = reg.build(&cfg.tasks[0]).expect("file task");
        assert_eq!(task.describe(), "File: /etc/kubernetes/kubelet.conf");

        let err = reg.build(&cfg.tasks[1]).err().expect("unknown field");
        assert!(matches!(err, Error::Config(_)), "{err}");
        assert!(err.to_string().contains("content"), "{err}");

        let err = reg.build(&cfg.tasks[2]).err().expect("unknown kind");
        assert!(matches!(err, Error::UnknownKind { ref kind, .. } if kind == "sysctl"));
    }
}
