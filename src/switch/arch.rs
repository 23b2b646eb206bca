/// Emits a global function symbol, taking care of the Mach-O underscore prefix.
///
/// Declared ahead of the arch modules so they can see it.
macro_rules! asm_func {
  ($name:literal, $body:literal $(, $($args:tt)*)?) => {
    cfg_if::cfg_if! {
      if #[cfg(target_vendor="apple")] {
        core::arch::global_asm!(
          concat!(".global _", $name),
          ".p2align 4",
          concat!("_", $name, ":"),
          $body
          $(, $($args)*)?
        );
      } else {
        core::arch::global_asm!(
          concat!(".global ", $name),
          concat!(".type ", $name, ", %function"),
          ".p2align 4",
          concat!($name, ":"),
          $body,
          concat!(".size ", $name, ", .-", $name)
          $(, $($args)*)?
        );
      }
    }
  };
}

#[cfg(target_arch="aarch64")]
mod aarch64;
#[cfg(target_arch="aarch64")]
pub use aarch64::*;

#[cfg(all(target_arch="x86_64", unix))]
mod x86_64_unix;
#[cfg(all(target_arch="x86_64", unix))]
pub use x86_64_unix::*;

// windows x86_64 also has to carry xmm6-xmm15 and the TIB stack bounds.
// #[cfg(all(target_arch="x86_64", windows))]
// mod x86_64_windows;

#[cfg(not(any(
  target_arch="aarch64",
  all(target_arch="x86_64", unix),
)))]
compile_error!("Unsupported target platform!");
