//! Linked-clone instances.

use chrono::{DateTime, Utc};

use vmgrid_state::VmInstance;

/// Derive a fresh instance from a template instance.
///
/// The clone gets a new identity (`{vmid}_{HHMMSSddmmYYYY}{micros}`), copies
/// every configured field, and records its parent. Runtime state starts
/// clean. The template is not modified.
pub fn create_linked_clone(template: &VmInstance) -> VmInstance {
    create_linked_clone_at(template, Utc::now())
}

pub(crate) fn create_linked_clone_at(template: &VmInstance, now: DateTime<Utc>) -> VmInstance {
    let parent = template.template_vmid().to_string();
    VmInstance {
        vmid: clone_name(&parent, now),
        labels: template.labels.clone(),
        remote_fs: template.remote_fs.clone(),
        launcher: template.launcher.clone(),
        post_build_behavior: template.post_build_behavior,
        retention: template.retention.clone(),
        parent_vmid: Some(parent),
        is_linked_clone: true,
        provisioned: false,
        agent_name: None,
        last_power_state: None,
    }
}

fn clone_name(parent: &str, now: DateTime<Utc>) -> String {
    format!("{}_{}", parent, now.format("%H%M%S%d%m%Y%6f"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use vmgrid_core::{PostBuildBehavior, RetentionPolicy, VmTemplate};

    fn template() -> VmInstance {
        let t = VmTemplate::new("build1", "linux docker")
            .with_remote_fs("/home/ci")
            .with_behavior(PostBuildBehavior::Stop)
            .with_retention(RetentionPolicy::RunOnce);
        VmInstance::from_template(&t)
    }

    #[test]
    fn clone_copies_fields_and_links_parent() {
        let parent = template();
        let clone = create_linked_clone(&parent);

        assert!(clone.vmid.starts_with("build1_"));
        assert_ne!(clone.vmid, parent.vmid);
        assert_eq!(clone.parent_vmid.as_deref(), Some("build1"));
        assert!(clone.is_linked_clone);
        assert_eq!(clone.labels, parent.labels);
        assert_eq!(clone.remote_fs, parent.remote_fs);
        assert_eq!(clone.post_build_behavior, PostBuildBehavior::Stop);
        assert_eq!(clone.retention, RetentionPolicy::RunOnce);
        assert!(!clone.provisioned);
        assert!(clone.agent_name.is_none());
    }

    #[test]
    fn template_is_untouched() {
        let parent = template();
        let before = parent.clone();
        let _ = create_linked_clone(&parent);
        assert_eq!(parent, before);
    }

    #[test]
    fn separated_clones_get_distinct_names() {
        let parent = template();
        let t0 = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();
        let t1 = t0 + chrono::Duration::seconds(1);
        let t2 = t0 + chrono::Duration::microseconds(1);

        let a = create_linked_clone_at(&parent, t0);
        let b = create_linked_clone_at(&parent, t1);
        let c = create_linked_clone_at(&parent, t2);

        assert_eq!(a.vmid, "build1_09265314032026000000");
        assert_ne!(a.vmid, b.vmid);
        assert_ne!(a.vmid, c.vmid);
        assert_eq!(a.parent_vmid, b.parent_vmid);
    }

    #[test]
    fn clone_of_clone_keeps_original_parent() {
        let first = create_linked_clone(&template());
        let second = create_linked_clone(&first);
        assert_eq!(second.parent_vmid.as_deref(), Some("build1"));
        assert!(second.vmid.starts_with("build1_"));
    }
}
