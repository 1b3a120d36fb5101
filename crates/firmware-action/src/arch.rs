/// Fold user-visible spellings into `i386` / `amd64`; anything else passes through.
pub fn normalize_arch(arch: &str) -> String {
    match arch {
        "IA-32" | "IA32" | "i686" | "386" | "x86" | "x86-32" | "x86_32" => "i386".into(),
        "AMD64" | "x64" | "x86-64" | "x86_64" => "amd64".into(),
        other => other.into(),
    }
}

/// Linux kernel `ARCH=` value.
pub fn normalize_arch_for_linux(arch: &str) -> String {
    match normalize_arch(arch).as_str() {
        "i386" | "amd64" => "x86".into(),
        other => other.into(),
    }
}

/// Host architecture in canonical spelling.
pub fn host_arch() -> String {
    match std::env::consts::ARCH {
        "aarch64" => "arm64".into(),
        other => normalize_arch(other),
    }
}

/// `CROSS_COMPILE` prefix for building `arch` binaries on another host.
pub fn cross_compile_prefix(arch: &str) -> Option<&'static str> {
    match normalize_arch(arch).as_str() {
        "i386" => Some("i686-linux-gnu-"),
        "amd64" => Some("x86-64-linux-gnu-"),
        "arm" => Some("arm-linux-gnueabi-"),
        "arm64" => Some("aarch64-linux-gnu-"),
        _ => None,
    }
}

pub fn is_x86(arch: &str) -> bool {
    matches!(normalize_arch(arch).as_str(), "i386" | "amd64")
}

#[cfg(test)]
mod tests {
    use super::*;

    const INPUTS: &[&str] = &[
        "IA-32", "IA32", "i686", "386", "x86", "x86-32", "x86_32", "AMD64", "x64", "x86-64",
        "x86_64", "arm", "arm64", "riscv", "i386", "amd64", "",
    ];

    #[test]
    fn folds_known_spellings() {
        assert_eq!(normalize_arch("IA32"), "i386");
        assert_eq!(normalize_arch("x86_64"), "amd64");
        assert_eq!(normalize_arch("arm64"), "arm64");
        assert_eq!(normalize_arch_for_linux("x86-64"), "x86");
        assert_eq!(normalize_arch_for_linux("386"), "x86");
        assert_eq!(normalize_arch_for_linux("arm"), "arm");
    }

    #[test]
    fn normalization_is_idempotent() {
        for x in INPUTS {
            let once = normalize_arch(x);
            assert_eq!(normalize_arch(&once), once, "normalize_arch({x})");
            let once = normalize_arch_for_linux(x);
            assert_eq!(normalize_arch_for_linux(&once), once, "linux({x})");
        }
    }

    #[test]
    fn cross_compile_table() {
        assert_eq!(cross_compile_prefix("x86_64"), Some("x86-64-linux-gnu-"));
        assert_eq!(cross_compile_prefix("i686"), Some("i686-linux-gnu-"));
        assert_eq!(cross_compile_prefix("arm64"), Some("aarch64-linux-gnu-"));
        assert_eq!(cross_compile_prefix("mips"), None);
    }
}
