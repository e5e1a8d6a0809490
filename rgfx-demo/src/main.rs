#![deny(unsafe_op_in_unsafe_fn)]
#![warn(clippy::undocumented_unsafe_blocks)]

use std::{
    fs::{self, File},
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use clap::Parser;
use rgfx::{
    BufferHandle, DescriptorSetHandle, FrameOutcome, FrameRecorder, PipelineHandle,
    RecordContext, RecordError, Renderer, RendererConfig, TextureHandle,
    ash::vk,
    descriptor::DescriptorBindingDesc,
    device_select::QueueMode,
    image::TextureDesc,
    instance::VulkanLogLevel,
    pipeline::{BlendMode, ColorAttachmentDesc, DepthState, PipelineDesc},
    record::{ColorAttachment, DepthAttachment, RenderingDesc},
    shader::{ShaderSource, ShaderStage},
};
use tracing_subscriber::{Layer, layer::SubscriberExt, util::SubscriberInitExt};
use winit::{
    application::ApplicationHandler,
    dpi::PhysicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow},
    window::{Window as WinitWindow, WindowAttributes, WindowId},
};

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Default, clap::ValueEnum)]
enum TracingLogLevel {
    Off,
    Trace,
    Info,
    Debug,
    Warn,
    #[default]
    Error,
}

impl From<TracingLogLevel> for tracing::Level {
    fn from(value: TracingLogLevel) -> Self {
        match value {
            // Off never reaches the subscriber
            TracingLogLevel::Off => tracing::Level::TRACE,
            TracingLogLevel::Trace => tracing::Level::TRACE,
            TracingLogLevel::Info => tracing::Level::INFO,
            TracingLogLevel::Debug => tracing::Level::DEBUG,
            TracingLogLevel::Warn => tracing::Level::WARN,
            TracingLogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
enum CliQueueMode {
    #[default]
    Auto,
    Unified,
    Single,
}

impl From<CliQueueMode> for QueueMode {
    fn from(value: CliQueueMode) -> Self {
        match value {
            CliQueueMode::Auto => QueueMode::Auto,
            CliQueueMode::Unified => QueueMode::Unified,
            CliQueueMode::Single => QueueMode::Single,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum CliVulkanLogLevel {
    Verbose,
    Info,
    Warning,
    Error,
}

impl From<CliVulkanLogLevel> for VulkanLogLevel {
    fn from(value: CliVulkanLogLevel) -> Self {
        match value {
            CliVulkanLogLevel::Verbose => VulkanLogLevel::Verbose,
            CliVulkanLogLevel::Info => VulkanLogLevel::Info,
            CliVulkanLogLevel::Warning => VulkanLogLevel::Warning,
            CliVulkanLogLevel::Error => VulkanLogLevel::Error,
        }
    }
}

#[derive(clap::Parser, Debug)]
struct CliArgs {
    #[arg(short, long, default_value = "error")]
    tracing_log_level: TracingLogLevel,
    #[arg(short, long)]
    graphics_debug_level: Option<CliVulkanLogLevel>,
    #[arg(long, default_value = "auto")]
    queue_mode: CliQueueMode,
    /// Accept integrated GPUs when no discrete one is present.
    #[arg(long)]
    allow_integrated: bool,
    /// TOML settings file. Defaults to `settings.toml` in the config dir.
    #[arg(long)]
    settings: Option<PathBuf>,
    #[arg(long, requires = "fragment_shader")]
    vertex_shader: Option<PathBuf>,
    #[arg(long, requires = "vertex_shader")]
    fragment_shader: Option<PathBuf>,
    /// Exit after this many presented frames.
    #[arg(long)]
    frames: Option<u64>,
    /// Render into an offscreen texture once at startup and verify the
    /// pixels read back from the GPU.
    #[arg(long)]
    readback_check: bool,
}

/// Optional on-disk settings. Command-line flags win over these.
#[derive(Debug, Clone, Default, PartialEq, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DemoSettings {
    app_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    frames_in_flight: Option<usize>,
    allow_integrated: Option<bool>,
    clear_color: Option<[f32; 4]>,
    vertex_shader: Option<PathBuf>,
    fragment_shader: Option<PathBuf>,
}

impl DemoSettings {
    fn load(path: &Path) -> eyre::Result<Self> {
        let text = fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    fn load_or_default(explicit: Option<&Path>, config_dir: Option<&Path>) -> eyre::Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }
        match config_dir.map(|dir| dir.join("settings.toml")) {
            Some(path) if path.is_file() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }
}

const DEFAULT_CLEAR_COLOR: [f32; 4] = [0.02, 0.02, 0.05, 1.0];

#[derive(Debug, Clone)]
struct DemoOptions {
    config: RendererConfig,
    clear_color: [f32; 4],
    shaders: Option<(PathBuf, PathBuf)>,
    frame_limit: Option<u64>,
    readback_check: bool,
}

impl DemoOptions {
    fn resolve(cli: &CliArgs, settings: DemoSettings) -> Self {
        let mut config = RendererConfig::default();
        if let Some(app_name) = settings.app_name {
            config.app_name = app_name;
        }
        if let (Some(width), Some(height)) = (settings.width, settings.height) {
            config.extent = vk::Extent2D { width, height };
        }
        if let Some(frames) = settings.frames_in_flight {
            config.frames_in_flight = frames;
        }
        config.validation = cli.graphics_debug_level.map(Into::into);
        config.device.queue_mode = cli.queue_mode.into();
        config.device.discrete_only =
            !(cli.allow_integrated || settings.allow_integrated.unwrap_or(false));

        let shaders = match (&cli.vertex_shader, &cli.fragment_shader) {
            (Some(vs), Some(fs)) => Some((vs.clone(), fs.clone())),
            _ => settings.vertex_shader.zip(settings.fragment_shader),
        };

        Self {
            config,
            clear_color: settings.clear_color.unwrap_or(DEFAULT_CLEAR_COLOR),
            shaders,
            frame_limit: cli.frames,
            readback_check: cli.readback_check,
        }
    }
}

fn main() -> eyre::Result<()> {
    let app_dirs = directories::ProjectDirs::from("", "rgfx", "rgfx-demo");

    let log_dir = match app_dirs
        .as_ref()
        .and_then(|x| x.runtime_dir().or_else(|| Some(x.data_dir())))
        .map(|p| p.to_owned())
    {
        Some(path) => path,
        None => std::env::current_dir()?,
    };

    let cli_args = CliArgs::parse();

    if cli_args.tracing_log_level != TracingLogLevel::Off {
        fs::create_dir_all(&log_dir)?;

        let mut log_file_path = log_dir.clone();
        log_file_path.push("log-file");
        log_file_path.set_extension("txt");
        let log_file = File::create(&log_file_path)?;
        let file_log = tracing_subscriber::fmt::layer()
            .with_writer(log_file)
            .with_ansi(false);

        println!("log_file_path: {}", log_file_path.display());
        println!("cli_args: {:#?}", cli_args);

        let stdout_log = tracing_subscriber::fmt::layer().pretty();

        tracing_subscriber::registry()
            .with(
                stdout_log
                    .with_filter(tracing_subscriber::filter::LevelFilter::from_level(
                        cli_args.tracing_log_level.into(),
                    ))
                    .and_then(file_log),
            )
            .init();
    }

    let settings = DemoSettings::load_or_default(
        cli_args.settings.as_deref(),
        app_dirs.as_ref().map(|dirs| dirs.config_dir()),
    )?;
    let options = DemoOptions::resolve(&cli_args, settings);
    tracing::debug!("Demo options: {options:#?}");

    let event_loop = winit::event_loop::EventLoop::builder().build()?;
    let mut app = AppRunner {
        options,
        state: None,
        failure: None,
    };

    tracing::trace!("Entering main event loop");
    event_loop.run_app(&mut app)?;
    match app.failure {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Scene
// ---------------------------------------------------------------------------

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
struct SceneUniform {
    tint: [f32; 4],
    time: f32,
    _pad: [f32; 3],
}

#[derive(Debug)]
struct Triangle {
    pipeline: PipelineHandle,
    uniforms: BufferHandle,
    set: DescriptorSetHandle,
}

impl Triangle {
    fn new(renderer: &mut Renderer<WinitWindow>, vs: &Path, fs: &Path) -> eyre::Result<Self> {
        let shaders = [
            ShaderSource::from_file(ShaderStage::Vertex, vs)?,
            ShaderSource::from_file(ShaderStage::Fragment, fs)?,
        ];
        let desc = PipelineDesc {
            set_layouts: vec![vec![DescriptorBindingDesc::new(
                0,
                vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC,
                vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
            )]],
            color_attachments: vec![ColorAttachmentDesc {
                format: renderer.swapchain().format(),
                blend: BlendMode::Opaque,
            }],
            depth: Some(DepthState::default()),
            depth_format: Some(renderer.device().depth_formats().depth),
            ..PipelineDesc::default()
        };
        let pipeline = renderer.create_pipeline(&desc, &shaders, Some("triangle"))?;
        // One record per frame slot so in-flight frames keep their data.
        let uniforms = renderer.create_uniform_buffer(
            std::mem::size_of::<SceneUniform>() as vk::DeviceSize,
            renderer.frames_in_flight() as u32,
            Some("scene uniforms"),
        )?;
        let set = renderer.allocate_descriptor_set(pipeline, 0, None)?;
        renderer.write_buffer_descriptor(set, 0, uniforms)?;
        renderer.flush_descriptor_set(set)?;
        Ok(Self {
            pipeline,
            uniforms,
            set,
        })
    }
}

#[derive(Debug)]
struct Scene {
    clear_color: [f32; 4],
    triangle: Option<Triangle>,
    started: Instant,
}

impl FrameRecorder for Scene {
    fn record(&mut self, ctx: &mut RecordContext<'_>) -> Result<(), RecordError> {
        let record = ctx.info().slot as u32;
        if let Some(triangle) = &self.triangle {
            let time = self.started.elapsed().as_secs_f32();
            let uniform = SceneUniform {
                tint: [time.sin() * 0.5 + 0.5, 0.4, time.cos() * 0.5 + 0.5, 1.0],
                time,
                _pad: [0.0; 3],
            };
            ctx.update_uniform_pod(triangle.uniforms, record, &uniform)?;
        }

        ctx.begin_rendering(&RenderingDesc {
            color: vec![ColorAttachment::swapchain_cleared(self.clear_color)],
            depth: self
                .triangle
                .as_ref()
                .map(|_| DepthAttachment::default()),
            render_area: None,
        })?;
        if let Some(triangle) = &self.triangle {
            ctx.bind_pipeline(triangle.pipeline)?;
            ctx.set_full_viewport();
            let offset = ctx.dynamic_offset(triangle.uniforms, record)?;
            ctx.bind_descriptor_set(triangle.set, &[offset])?;
            ctx.draw(3, 1, 0, 0)?;
        }
        ctx.end_rendering()
    }
}

const READBACK_SIZE: u32 = 4;
const READBACK_CLEAR: [f32; 4] = [1.0, 0.0, 0.0, 1.0];

/// Clears a small offscreen texture on the GPU, copies it into a buffer and
/// checks the bytes that come back.
fn readback_check(renderer: &mut Renderer<WinitWindow>, clear_color: [f32; 4]) -> eyre::Result<()> {
    let mut desc = TextureDesc::new_2d(READBACK_SIZE, READBACK_SIZE, vk::Format::R8G8B8A8_UNORM);
    desc.extra_usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC;
    let texture = renderer.create_texture(&desc, None, Some("readback target"))?;
    let byte_len = (READBACK_SIZE * READBACK_SIZE * 4) as usize;
    let buffer = renderer.registry_mut().create_buffer(
        &vec![0; byte_len],
        vk::BufferUsageFlags::TRANSFER_DST,
        Some("readback copy"),
    )?;

    let mut recorder = |ctx: &mut RecordContext<'_>| -> Result<(), RecordError> {
        offscreen_pass(ctx, texture, buffer)?;
        ctx.begin_rendering(&RenderingDesc {
            color: vec![ColorAttachment::swapchain_cleared(clear_color)],
            ..RenderingDesc::default()
        })?;
        ctx.end_rendering()
    };
    // The swapchain may be minimised at startup; skipped frames record
    // nothing, so keep going until one lands.
    let mut attempts = 0;
    loop {
        match renderer.draw_frame(&mut recorder)? {
            FrameOutcome::Presented(_) => break,
            FrameOutcome::Skipped(reason) if attempts < 8 => {
                tracing::debug!("Readback frame skipped: {reason:?}");
                attempts += 1;
            }
            FrameOutcome::Skipped(reason) => {
                eyre::bail!("readback frame never rendered, last skip: {reason:?}")
            }
        }
    }

    let bytes = renderer.read_buffer(buffer)?;
    let expected = [255u8, 0, 0, 255];
    let mismatches = bytes
        .chunks_exact(4)
        .filter(|texel| *texel != expected)
        .count();
    renderer.destroy_buffer(buffer)?;
    renderer.destroy_texture(texture)?;
    if mismatches != 0 {
        eyre::bail!("readback returned {mismatches} unexpected texels");
    }
    tracing::info!("Readback check passed ({} texels)", bytes.len() / 4);
    Ok(())
}

fn offscreen_pass(
    ctx: &mut RecordContext<'_>,
    texture: TextureHandle,
    buffer: BufferHandle,
) -> Result<(), RecordError> {
    ctx.begin_rendering(&RenderingDesc {
        color: vec![ColorAttachment::texture_cleared(texture, READBACK_CLEAR)],
        ..RenderingDesc::default()
    })?;
    ctx.end_rendering()?;
    ctx.copy_texture_to_buffer(texture, buffer)?;
    ctx.transition_texture(texture, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
}

// ---------------------------------------------------------------------------
// Application state
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct AppRunner {
    options: DemoOptions,
    state: Option<App>,
    failure: Option<eyre::Report>,
}

#[derive(Debug)]
enum App {
    Running(RunningState),
    Suspended(SuspendedState),
    Exiting,
}

#[derive(Debug)]
struct RunningState {
    // Scene handles belong to the renderer, so it goes first.
    scene: Scene,
    renderer: Renderer<WinitWindow>,
    win: Arc<WinitWindow>,
    presented: u64,
}

#[derive(Debug)]
struct SuspendedState {
    win: Arc<WinitWindow>,
}

impl AppRunner {
    fn start(&mut self, win: Arc<WinitWindow>) -> eyre::Result<RunningState> {
        let size = win.inner_size();
        let mut config = self.options.config.clone();
        config.extent = vk::Extent2D {
            width: size.width,
            height: size.height,
        };
        let mut renderer = Renderer::init(&config, Arc::clone(&win))?;
        renderer.set_resize_hook(|extent| tracing::debug!("Swapchain rebuilt at {extent:?}"));

        if self.options.readback_check {
            readback_check(&mut renderer, self.options.clear_color)?;
            self.options.readback_check = false;
        }
        let triangle = match &self.options.shaders {
            Some((vs, fs)) => Some(Triangle::new(&mut renderer, vs, fs)?),
            None => None,
        };
        Ok(RunningState {
            scene: Scene {
                clear_color: self.options.clear_color,
                triangle,
                started: Instant::now(),
            },
            renderer,
            win,
            presented: 0,
        })
    }

    fn fail(&mut self, from_state: &'static str, err: eyre::Report, event_loop: &ActiveEventLoop) {
        tracing::error!("{from_state}: {err:#}");
        self.failure = Some(err);
        self.transition_to_exiting(from_state, event_loop);
    }

    fn transition_to_exiting(&mut self, from_state: &'static str, event_loop: &ActiveEventLoop) {
        tracing::debug!("State transition: {} -> Exiting", from_state);
        self.state = Some(App::Exiting);
        event_loop.exit();
    }

    fn as_running_mut(&mut self) -> Option<&mut RunningState> {
        match &mut self.state {
            Some(App::Running(s)) => Some(s),
            _ => None,
        }
    }

    fn is_running_window(&self, window_id: WindowId) -> bool {
        matches!(&self.state, Some(App::Running(s)) if s.win.id() == window_id)
    }

    /// Draws one frame, stopping the demo on error or at the frame limit.
    fn redraw(&mut self, event_loop: &ActiveEventLoop) {
        let limit = self.options.frame_limit;
        let Some(running) = self.as_running_mut() else {
            return;
        };
        match running.renderer.draw_frame(&mut running.scene) {
            Ok(FrameOutcome::Presented(info)) => {
                tracing::trace!("Presented frame {}", info.frame_number);
                running.presented += 1;
                if limit.is_some_and(|limit| running.presented >= limit) {
                    tracing::info!("Frame limit reached after {} frames", running.presented);
                    self.shutdown_running(event_loop);
                }
            }
            Ok(FrameOutcome::Skipped(reason)) => {
                tracing::trace!("Frame skipped: {reason:?}");
            }
            Err(err) => {
                self.fail("Running", err.into(), event_loop);
            }
        }
    }

    fn shutdown_running(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(App::Running(running)) = self.state.take() {
            let RunningState {
                scene, renderer, ..
            } = running;
            drop(scene);
            if let Err(e) = renderer.shutdown() {
                tracing::error!("Error while waiting for device idle on exit: {}", e);
            }
        }
        self.transition_to_exiting("Running", event_loop);
    }
}

impl ApplicationHandler for AppRunner {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        let win = match self.state.take() {
            None => {
                let config = &self.options.config;
                let attributes = WindowAttributes::default()
                    .with_title(config.app_name.clone())
                    .with_inner_size(PhysicalSize::new(config.extent.width, config.extent.height));
                match event_loop.create_window(attributes) {
                    Ok(w) => Arc::new(w),
                    Err(e) => {
                        self.fail("Initializing", e.into(), event_loop);
                        return;
                    }
                }
            }
            Some(App::Suspended(SuspendedState { win })) => win,
            other => {
                tracing::warn!("resumed() called in state {other:?}");
                self.state = other;
                return;
            }
        };

        event_loop.set_control_flow(ControlFlow::Poll);
        match self.start(win) {
            Ok(running) => {
                tracing::debug!("State transition: -> Running");
                self.state = Some(App::Running(running));
            }
            Err(e) => self.fail("Initializing", e, event_loop),
        }
    }

    fn suspended(&mut self, event_loop: &ActiveEventLoop) {
        if let Some(App::Running(running)) = self.state.take() {
            event_loop.set_control_flow(ControlFlow::Wait);
            let RunningState {
                scene,
                renderer,
                win,
                ..
            } = running;
            // Surfaces cannot outlive a suspend on some platforms, so the
            // whole renderer goes and is rebuilt on resume.
            drop(scene);
            if let Err(e) = renderer.shutdown() {
                self.fail("Running", e.into(), event_loop);
                return;
            }
            tracing::debug!("State transition: Running -> Suspended");
            self.state = Some(App::Suspended(SuspendedState { win }));
        }
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        window_id: WindowId,
        window_event: WindowEvent,
    ) {
        if !self.is_running_window(window_id) {
            return;
        }

        match window_event {
            WindowEvent::CloseRequested => {
                tracing::trace!("Close window request received for window");
                self.shutdown_running(event_loop);
            }
            WindowEvent::Resized(size) => {
                if let Some(running) = self.as_running_mut() {
                    running.renderer.on_framebuffer_resize(size.width, size.height);
                }
            }
            WindowEvent::ScaleFactorChanged { .. } => {
                if let Some(running) = self.as_running_mut() {
                    let size = running.win.inner_size();
                    running.renderer.on_framebuffer_resize(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => self.redraw(event_loop),
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(App::Running(running)) = &self.state {
            running.win.request_redraw();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> CliArgs {
        CliArgs::parse_from(std::iter::once("rgfx-demo").chain(args.iter().copied()))
    }

    #[test]
    fn settings_parse_from_toml() {
        let settings: DemoSettings = toml::from_str(
            r#"
            app_name = "triangle"
            width = 1024
            height = 768
            clear_color = [0.0, 0.5, 1.0, 1.0]
            "#,
        )
        .unwrap();
        assert_eq!(settings.app_name.as_deref(), Some("triangle"));
        assert_eq!(settings.width, Some(1024));
        assert_eq!(settings.clear_color, Some([0.0, 0.5, 1.0, 1.0]));
        assert_eq!(settings.vertex_shader, None);
    }

    #[test]
    fn unknown_settings_are_rejected() {
        assert!(toml::from_str::<DemoSettings>("widht = 3").is_err());
    }

    #[test]
    fn settings_fill_renderer_config() {
        let settings = DemoSettings {
            width: Some(1024),
            height: Some(768),
            frames_in_flight: Some(2),
            allow_integrated: Some(true),
            ..DemoSettings::default()
        };
        let options = DemoOptions::resolve(&cli(&[]), settings);
        assert_eq!(
            options.config.extent,
            vk::Extent2D {
                width: 1024,
                height: 768
            }
        );
        assert_eq!(options.config.frames_in_flight, 2);
        assert!(!options.config.device.discrete_only);
        assert_eq!(options.clear_color, DEFAULT_CLEAR_COLOR);
    }

    #[test]
    fn command_line_wins_over_settings() {
        let settings = DemoSettings {
            vertex_shader: Some("a.vert.spv".into()),
            fragment_shader: Some("a.frag.spv".into()),
            ..DemoSettings::default()
        };
        let args = cli(&[
            "--vertex-shader",
            "b.vert.spv",
            "--fragment-shader",
            "b.frag.spv",
            "--queue-mode",
            "single",
            "--frames",
            "10",
        ]);
        let options = DemoOptions::resolve(&args, settings);
        assert_eq!(
            options.shaders,
            Some(("b.vert.spv".into(), "b.frag.spv".into()))
        );
        assert_eq!(options.config.device.queue_mode, QueueMode::Single);
        assert_eq!(options.frame_limit, Some(10));
        assert!(options.config.device.discrete_only);
    }
}
