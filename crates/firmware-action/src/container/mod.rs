use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, OnceLock};

use crate::error::{Error, ErrorKind, Result};
use crate::executor::ExecCtx;
use crate::fsutil;

pub mod discontinued;
pub mod ssh;

pub use discontinued::Discontinued;

const FILE_PREFIX: &str = "file://";
const TAR_EXTENSIONS: &[&str] = &[".tar", ".tar.gz", ".tgz", ".tar.xz", ".tar.bz2", ".tar.zst"];

#[derive(Debug, Clone, Default)]
pub struct SetupOpts {
    pub container_url: String,
    pub mount_container_dir: String,
    pub mount_host_dir: String,
    pub workdir_container: String,
    pub container_input_dir: String,
    pub input_files: Vec<String>,
    pub input_dirs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Url(String),
    Tarfile(PathBuf),
    Recipe(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub container_path: String,
    pub host_path: PathBuf,
    pub container_is_dir: bool,
    pub host_is_dir: bool,
}

pub fn classify_source(source: &str) -> Result<ImageSource> {
    let source = source.trim();
    let Some(raw) = source.strip_prefix(FILE_PREFIX) else {
        return Ok(ImageSource::Url(source.to_string()));
    };
    let path = PathBuf::from(raw);
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or_default()
        .to_string();

    if name == "Dockerfile" {
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        if !dir.is_dir() || !path.is_file() {
            return Err(Error::new(
                ErrorKind::NotExist,
                format!("container recipe {}", path.display()),
            ));
        }
        return Ok(ImageSource::Recipe(dir));
    }
    if TAR_EXTENSIONS.iter().any(|ext| name.ends_with(ext)) {
        match fsutil::path_kind(&path)? {
            fsutil::PathKind::File => return Ok(ImageSource::Tarfile(path)),
            fsutil::PathKind::Dir => {
                return Err(Error::new(
                    ErrorKind::PathIsDirectory,
                    format!("container archive {}", path.display()),
                ));
            }
            fsutil::PathKind::Missing => {
                return Err(Error::new(
                    ErrorKind::NotExist,
                    format!("container archive {}", path.display()),
                ));
            }
        }
    }
    match fsutil::path_kind(&path)? {
        fsutil::PathKind::Dir => Ok(ImageSource::Recipe(path)),
        fsutil::PathKind::File => Err(Error::msg(format!(
            "'{}' is neither a tar archive nor a Dockerfile",
            path.display()
        ))),
        fsutil::PathKind::Missing => Err(Error::new(
            ErrorKind::NotExist,
            format!("container recipe directory {}", path.display()),
        )),
    }
}

/// Static checks on `opts`, in the order the driver applies them.
pub fn validate_setup(opts: &SetupOpts, deny: &Discontinued) -> Result<ImageSource> {
    for (name, value) in [
        ("mount_container_dir", &opts.mount_container_dir),
        ("mount_host_dir", &opts.mount_host_dir),
        ("workdir_container", &opts.workdir_container),
    ] {
        if value.trim().is_empty() {
            return Err(Error::new(ErrorKind::DirectoryNotSpecified, name));
        }
    }
    let mount = opts.mount_container_dir.trim();
    if mount == "." || mount == "/" {
        return Err(Error::new(
            ErrorKind::DirectoryInvalid,
            format!("mount_container_dir cannot be '{mount}'"),
        ));
    }

    let source = classify_source(&opts.container_url)?;
    if let ImageSource::Url(url) = &source {
        if url.is_empty() {
            return Err(Error::new(ErrorKind::EmptyUrl, "container_url"));
        }
        deny.check(url)?;
    }

    let has_inputs = !opts.input_files.is_empty() || !opts.input_dirs.is_empty();
    if has_inputs && opts.container_input_dir.trim().is_empty() {
        return Err(Error::new(
            ErrorKind::DirectoryNotSpecified,
            "container_input_dir is required when input_files or input_dirs are set",
        ));
    }
    Ok(source)
}

static ENGINE: OnceLock<String> = OnceLock::new();

/// The container engine binary: `FIRMWARE_ACTION_CONTAINER_ENGINE`, else docker, else podman.
pub fn engine() -> Result<&'static str> {
    if let Some(e) = ENGINE.get() {
        return Ok(e.as_str());
    }
    let picked = pick_container_engine()?;
    Ok(ENGINE.get_or_init(|| picked).as_str())
}

fn pick_container_engine() -> Result<String> {
    if let Ok(pref) = std::env::var("FIRMWARE_ACTION_CONTAINER_ENGINE") {
        let pref = pref.trim();
        if pref.is_empty() {
            return Err(Error::msg("FIRMWARE_ACTION_CONTAINER_ENGINE is set but empty"));
        }
        if command_works(pref, &["--version"]) {
            return Ok(pref.to_string());
        }
        return Err(Error::msg(format!(
            "container engine '{pref}' from FIRMWARE_ACTION_CONTAINER_ENGINE is not available"
        )));
    }

    for candidate in ["docker", "podman"] {
        if command_works(candidate, &["--version"]) {
            return Ok(candidate.to_string());
        }
    }
    Err(Error::msg(
        "no container engine found (tried docker, podman); set FIRMWARE_ACTION_CONTAINER_ENGINE",
    ))
}

fn command_works(bin: &str, args: &[&str]) -> bool {
    Command::new(bin)
        .args(args)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

fn image_exists(engine: &str, image: &str) -> bool {
    command_works(engine, &["image", "inspect", image])
}

fn repo_start_lock(repo: &Path) -> Result<Arc<Mutex<()>>> {
    static LOCKS: OnceLock<Mutex<BTreeMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    let key = repo
        .canonicalize()
        .unwrap_or_else(|_| fsutil::normalize(repo));
    let mut map = LOCKS
        .get_or_init(|| Mutex::new(BTreeMap::new()))
        .lock()
        .map_err(|_| Error::msg("container start lock poisoned"))?;
    Ok(Arc::clone(map.entry(key).or_default()))
}

fn container_path(workdir: &str, p: &str) -> String {
    if p.starts_with('/') {
        p.to_string()
    } else {
        format!("{}/{}", workdir.trim_end_matches('/'), p.trim_start_matches("./"))
    }
}

fn base_name(p: &str) -> String {
    Path::new(p.trim_end_matches('/'))
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or(p)
        .to_string()
}

#[derive(Debug)]
pub struct Container {
    engine: String,
    name: String,
    image: String,
    workdir: String,
    env: BTreeMap<String, String>,
}

impl Container {
    pub fn setup(ctx: &ExecCtx, opts: &SetupOpts) -> Result<Self> {
        let source = validate_setup(opts, &ctx.discontinued)?;
        let engine = engine()?.to_string();
        let image = obtain_image(ctx, &engine, &source)?;

        let host_dir = PathBuf::from(opts.mount_host_dir.trim());
        fsutil::check_is_dir(&host_dir)?;

        let lock = repo_start_lock(&host_dir)?;
        let _guard = lock
            .lock()
            .map_err(|_| Error::msg("container start lock poisoned"))?;

        let name = format!(
            "firmware-action-{}-{}",
            fsutil::filenamify(ctx.module_id(), "").to_ascii_lowercase(),
            std::process::id()
        );
        // Leftovers from an interrupted run would block `--name`.
        let _ = Command::new(&engine)
            .args(["rm", "-f", &name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();

        let workdir = opts.workdir_container.trim().to_string();
        let mut run = Command::new(&engine);
        run.args(["run", "-d", "--name", &name])
            .arg("--workdir")
            .arg(&workdir)
            .args(["--entrypoint", "sleep"])
            .arg(&image)
            .arg("infinity");
        ctx.run_capture(run)
            .map_err(|e| e.wrap(ErrorKind::BuildFailed, format!("failed to start {image}")))?;

        let container = Self {
            engine,
            name,
            image,
            workdir,
            env: BTreeMap::new(),
        };
        ctx.log(&format!(
            "container '{}' started from '{}'",
            container.name, container.image
        ));

        let mount = opts.mount_container_dir.trim();
        container.mkdir(ctx, mount)?;
        container.copy_dir_contents_in(ctx, &host_dir, mount)?;

        if !opts.container_input_dir.trim().is_empty() {
            let input_dir = container_path(&container.workdir, opts.container_input_dir.trim());
            container.mkdir(ctx, &input_dir)?;
            // Each directory lands under its basename so inputs never nest into one another.
            for dir in &opts.input_dirs {
                let host = PathBuf::from(dir);
                fsutil::check_is_dir(&host)?;
                let dst = format!("{input_dir}/{}", fsutil::file_name_str(&host)?);
                container.copy_in(ctx, &host, &dst)?;
            }
            for file in &opts.input_files {
                let host = PathBuf::from(file);
                fsutil::check_is_file(&host)?;
                let dst = format!("{input_dir}/{}", fsutil::file_name_str(&host)?);
                container.copy_in(ctx, &host, &dst)?;
            }
        }

        container.sync(ctx)?;
        Ok(container)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn engine(&self) -> &str {
        &self.engine
    }

    pub fn set_env(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.env.insert(key.into(), value.into());
    }

    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn path(&self, p: &str) -> String {
        container_path(&self.workdir, p)
    }

    fn exec_command(&self, argv: &[&str]) -> Command {
        let mut cmd = Command::new(&self.engine);
        cmd.arg("exec").arg("--workdir").arg(&self.workdir);
        for (k, v) in &self.env {
            cmd.arg("-e").arg(format!("{k}={v}"));
        }
        cmd.arg(&self.name);
        cmd.args(argv);
        cmd
    }

    /// Runs one build step, streaming its output.
    pub fn exec(&self, ctx: &ExecCtx, argv: &[&str]) -> Result<()> {
        ctx.log(&format!("step: {}", argv.join(" ")));
        ctx.run_cmd(self.exec_command(argv))
            .map_err(|e| step_error(e, argv))
    }

    pub fn exec_shell(&self, ctx: &ExecCtx, line: &str) -> Result<()> {
        self.exec(ctx, &["bash", "-c", line])
    }

    pub fn output(&self, ctx: &ExecCtx, argv: &[&str]) -> Result<String> {
        ctx.run_capture(self.exec_command(argv))
            .map_err(|e| step_error(e, argv))
    }

    pub fn mkdir(&self, ctx: &ExecCtx, path: &str) -> Result<()> {
        ctx.run_capture(self.exec_command(&["mkdir", "-p", path]))
            .map(|_| ())
            .map_err(|e| e.wrap(ErrorKind::BuildFailed, format!("mkdir {path}")))
    }

    pub fn copy_in(&self, ctx: &ExecCtx, host: &Path, dst: &str) -> Result<()> {
        let mut cmd = Command::new(&self.engine);
        cmd.arg("cp")
            .arg(host)
            .arg(format!("{}:{}", self.name, dst));
        ctx.run_capture(cmd).map(|_| ()).map_err(|e| {
            e.wrap(
                ErrorKind::BuildFailed,
                format!("failed to copy {} into container at {dst}", host.display()),
            )
        })
    }

    fn copy_dir_contents_in(&self, ctx: &ExecCtx, host: &Path, dst: &str) -> Result<()> {
        self.copy_in(ctx, &host.join("."), dst)
    }

    /// Confirms the container is reachable after staging.
    fn sync(&self, ctx: &ExecCtx) -> Result<()> {
        ctx.run_capture(self.exec_command(&["true"]))
            .map(|_| ())
            .map_err(|e| {
                if e.is(ErrorKind::Cancelled) {
                    e
                } else {
                    classify_sync_failure(&e.to_string())
                }
            })
    }

    pub fn export(&self, ctx: &ExecCtx, artifacts: &[Artifact]) -> Result<()> {
        for a in artifacts {
            self.export_one(ctx, a).map_err(|e| {
                if e.is(ErrorKind::Cancelled) {
                    return e;
                }
                e.wrap(
                    ErrorKind::ExportFailed,
                    format!(
                        "'{}' -> '{}'",
                        a.container_path,
                        a.host_path.display()
                    ),
                )
            })?;
        }
        Ok(())
    }

    fn export_one(&self, ctx: &ExecCtx, a: &Artifact) -> Result<()> {
        let dst = if a.container_is_dir || a.host_is_dir {
            fsutil::ensure_dir(&a.host_path)?;
            a.host_path.join(base_name(&a.container_path))
        } else {
            if let Some(parent) = a.host_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fsutil::ensure_dir(parent)?;
            }
            a.host_path.clone()
        };
        let mut cmd = Command::new(&self.engine);
        cmd.arg("cp")
            .arg(format!("{}:{}", self.name, a.container_path))
            .arg(&dst);
        ctx.run_capture(cmd)?;
        ctx.log(&format!("exported {} -> {}", a.container_path, dst.display()));
        Ok(())
    }

    pub fn commit(&self, ctx: &ExecCtx, tag: &str) -> Result<String> {
        let mut cmd = Command::new(&self.engine);
        cmd.args(["commit", &self.name, tag]);
        ctx.run_capture(cmd)?;
        Ok(tag.to_string())
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        tracing::debug!(container = %self.name, "removing container");
        let res = Command::new(&self.engine)
            .args(["rm", "-f", &self.name])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = res {
            tracing::warn!(container = %self.name, "failed to remove container: {e}");
        }
    }
}

fn step_error(e: Error, argv: &[&str]) -> Error {
    if e.is(ErrorKind::Cancelled) {
        return e;
    }
    e.wrap(ErrorKind::BuildFailed, format!("'{}'", argv.join(" ")))
}

fn obtain_image(ctx: &ExecCtx, engine: &str, source: &ImageSource) -> Result<String> {
    match source {
        ImageSource::Url(url) => {
            ctx.log(&format!("pulling {url}"));
            let mut cmd = Command::new(engine);
            cmd.args(["pull", url]);
            if let Err(e) = ctx.run_cmd(cmd) {
                if e.is(ErrorKind::Cancelled) || !image_exists(engine, url) {
                    return Err(e.wrap(ErrorKind::BuildFailed, format!("failed to pull {url}")));
                }
                tracing::warn!("pull of {url} failed, using the local copy: {e}");
            }
            Ok(url.clone())
        }
        ImageSource::Tarfile(path) => {
            ctx.log(&format!("loading image archive {}", path.display()));
            let mut cmd = Command::new(engine);
            cmd.arg("load").arg("-i").arg(path);
            let out = ctx.run_capture(cmd)?;
            parse_loaded_image(&out).ok_or_else(|| {
                Error::msg(format!(
                    "could not determine image loaded from {}: {}",
                    path.display(),
                    out.trim()
                ))
            })
        }
        ImageSource::Recipe(dir) => build_recipe_image(ctx, engine, dir),
    }
}

fn build_recipe_image(ctx: &ExecCtx, engine: &str, dir: &Path) -> Result<String> {
    // Modules sharing a recipe would race building the same tag.
    static IMAGE_BOOTSTRAP_LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    let _guard = IMAGE_BOOTSTRAP_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .map_err(|_| Error::msg("container image bootstrap lock poisoned"))?;

    let abs = dir.canonicalize().unwrap_or_else(|_| fsutil::normalize(dir));
    let stem = abs
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("recipe");
    let tag = format!(
        "firmware-action-local/{}:latest",
        fsutil::filenamify(stem, "").to_ascii_lowercase()
    );
    ctx.log(&format!("building image '{tag}' from {}", abs.display()));
    let mut cmd = Command::new(engine);
    cmd.arg("build").arg("-t").arg(&tag).arg(&abs);
    ctx.run_cmd(cmd)
        .map_err(|e| e.wrap(ErrorKind::BuildFailed, format!("failed to build {tag}")))?;
    Ok(tag)
}

/// Extracts the image reference from `docker load` / `podman load` output.
pub fn parse_loaded_image(out: &str) -> Option<String> {
    out.lines().rev().find_map(|line| {
        let line = line.trim();
        line.strip_prefix("Loaded image:")
            .or_else(|| line.strip_prefix("Loaded image(s):"))
            .or_else(|| line.strip_prefix("Loaded image ID:"))
            .map(|s| s.trim().split(',').next().unwrap_or_default().trim().to_string())
            .filter(|s| !s.is_empty())
    })
}

/// Maps engine failures seen while staging to actionable errors.
pub fn classify_sync_failure(text: &str) -> Error {
    let lower = text.to_ascii_lowercase();
    let hint = if lower.contains("deadline exceeded") {
        "the container engine did not answer in time; check that its daemon is running and not \
         overloaded, then retry"
    } else if lower.contains("lookup") && lower.contains("i/o timeout") {
        "a DNS lookup timed out; check the host resolver configuration (/etc/resolv.conf) and the \
         engine's DNS settings"
    } else if lower.contains("session params") && lower.contains("timeout") {
        "the engine timed out setting up networking; the host is likely missing the iptable_nat \
         kernel module, load it with 'modprobe iptable_nat'"
    } else {
        return Error::new(ErrorKind::ContainerSyncFailed, text.trim().to_string());
    };
    Error::new(
        ErrorKind::ContainerSyncFailed,
        format!("{}; {hint}", text.trim()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn opts() -> SetupOpts {
        SetupOpts {
            container_url: "ghcr.io/example/coreboot:24.02".into(),
            mount_container_dir: "/src".into(),
            mount_host_dir: ".".into(),
            workdir_container: "/src".into(),
            ..Default::default()
        }
    }

    #[test]
    fn classify_url_and_local_sources() {
        assert_eq!(
            classify_source("ghcr.io/example/uroot:main").unwrap(),
            ImageSource::Url("ghcr.io/example/uroot:main".into())
        );

        let tmp = tempfile::tempdir().expect("tempdir");
        let tar = tmp.path().join("image.tar");
        fs::write(&tar, b"").unwrap();
        let recipe = tmp.path().join("recipe");
        fs::create_dir_all(&recipe).unwrap();
        fs::write(recipe.join("Dockerfile"), "FROM scratch\n").unwrap();

        assert_eq!(
            classify_source(&format!("file://{}", tar.display())).unwrap(),
            ImageSource::Tarfile(tar.clone())
        );
        assert_eq!(
            classify_source(&format!("file://{}", recipe.display())).unwrap(),
            ImageSource::Recipe(recipe.clone())
        );
        assert_eq!(
            classify_source(&format!("file://{}/Dockerfile", recipe.display())).unwrap(),
            ImageSource::Recipe(recipe.clone())
        );

        let missing_tar = format!("file://{}/nope.tar", tmp.path().display());
        assert!(classify_source(&missing_tar).unwrap_err().is(ErrorKind::NotExist));
        let missing_dir = format!("file://{}/nope", tmp.path().display());
        assert!(classify_source(&missing_dir).unwrap_err().is(ErrorKind::NotExist));
    }

    #[test]
    fn setup_validation_order() {
        let deny = Discontinued::default();

        let mut o = opts();
        o.workdir_container.clear();
        assert!(
            validate_setup(&o, &deny)
                .unwrap_err()
                .is(ErrorKind::DirectoryNotSpecified)
        );

        for bad in [".", "/"] {
            let mut o = opts();
            o.mount_container_dir = bad.into();
            assert!(
                validate_setup(&o, &deny)
                    .unwrap_err()
                    .is(ErrorKind::DirectoryInvalid)
            );
        }

        let mut o = opts();
        o.container_url.clear();
        assert!(validate_setup(&o, &deny).unwrap_err().is(ErrorKind::EmptyUrl));

        let mut o = opts();
        o.input_files = vec!["blob.bin".into()];
        assert!(
            validate_setup(&o, &deny)
                .unwrap_err()
                .is(ErrorKind::DirectoryNotSpecified)
        );
        o.container_input_dir = "inputs/".into();
        assert!(validate_setup(&o, &deny).is_ok());
    }

    #[test]
    fn setup_rejects_discontinued_images() {
        let deny = Discontinued {
            images: vec![discontinued::DiscontinuedEntry {
                reference: "ghcr.io/example/coreboot".into(),
                ..Default::default()
            }],
        };
        assert!(
            validate_setup(&opts(), &deny)
                .unwrap_err()
                .is(ErrorKind::ContainerDiscontinued)
        );
    }

    #[test]
    fn loaded_image_is_parsed() {
        assert_eq!(
            parse_loaded_image("Loaded image: example/edk2:stable\n").as_deref(),
            Some("example/edk2:stable")
        );
        assert_eq!(
            parse_loaded_image("Getting image source signatures\nLoaded image(s): localhost/x:1\n")
                .as_deref(),
            Some("localhost/x:1")
        );
        assert_eq!(
            parse_loaded_image("Loaded image ID: sha256:abcd\n").as_deref(),
            Some("sha256:abcd")
        );
        assert_eq!(parse_loaded_image("nothing here"), None);
    }

    #[test]
    fn sync_failures_carry_remediation() {
        let e = classify_sync_failure("rpc error: context deadline exceeded");
        assert!(e.is(ErrorKind::ContainerSyncFailed));
        assert!(e.to_string().contains("daemon"));

        let e = classify_sync_failure("dial tcp: lookup registry on 127.0.0.53:53: i/o timeout");
        assert!(e.to_string().contains("resolv.conf"));

        let e = classify_sync_failure("timeout waiting for session params");
        assert!(e.to_string().contains("iptable_nat"));

        let e = classify_sync_failure("something else");
        assert_eq!(e.message(), "something else");
    }

    #[test]
    fn container_paths_resolve_against_workdir() {
        assert_eq!(container_path("/src/", "build/coreboot.rom"), "/src/build/coreboot.rom");
        assert_eq!(container_path("/src", "./defconfig"), "/src/defconfig");
        assert_eq!(container_path("/src", "/out/x"), "/out/x");
        assert_eq!(base_name("/src/build/"), "build");
    }
}
