#![warn(rustdoc::missing_crate_level_docs)]
#![warn(missing_docs)]
//! Api contains the canonical keys, namespace patterns, and per-source
//! settings shared by the mirror controllers.

pub mod keys;
pub mod patterns;
pub mod source;

/// GROUP is the kubernetes label/annotation namespace for the controller.
pub static GROUP: &str = "projectmirror.io";

/// CONTROLLER_NAME is the value recorded in the management label and used as
/// the field manager on every write.
pub const CONTROLLER_NAME: &str = "mirror-controller";

/// Keyify sanitizes the key for use in k8s metadata.
fn keyify<S: ToString, K: AsRef<str>>(space: S, key: K) -> String {
    let mut out = space.to_string();
    key.as_ref()
        .chars()
        .map(|c| match c {
            '_' | ' ' | '\t' | '\n' => '-',
            _ => c.to_ascii_lowercase(),
        })
        .for_each(|c| out.push(c));
    out
}

/// Mirror_label returns the provided argument as a name in the
/// mirror-controller's space, sutable for use as an annotation or label.
pub fn mirror_label<S: AsRef<str>>(s: S) -> String {
    keyify("projectmirror.io/", s)
}
