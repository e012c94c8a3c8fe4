//! The thin OS-interface layer the rest of the crate is built on: anonymous
//! page mappings with adjustable protection, and a page-size query. Split
//! out so the platform-specific pieces stay separate from the portable
//! engine above it.

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        mod linux;
        pub(crate) use linux::*;
    } else {
        compile_error!("lsa currently only implements its OS interface for target_os = \"linux\"");
    }
}
