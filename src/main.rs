use std::{path::PathBuf, process, time::Instant};

use dxr_renderer::{
    geometry::{panel_geometry, Material, Transform},
    hal::Api,
    Renderer, RendererConfig, Result,
};
use glam::Vec3;

/// Two panel stacks, one of them emissive.
fn load_demo_scene<A: Api>(renderer: &mut Renderer<A>) -> Result<()> {
    let (vertices, indices) = panel_geometry(4);
    renderer.add_model(
        "Panels",
        vertices,
        &indices,
        Material::default(),
        Transform::from_position(Vec3::new(0.0, 0.0, 4.0)),
    )?;

    let (vertices, indices) = panel_geometry(1);
    renderer.add_model(
        "Light",
        vertices,
        &indices,
        Material {
            color: [4.0, 3.6, 3.0],
            is_emissive: 1,
            ..Default::default()
        },
        Transform {
            position: Vec3::new(0.0, 3.0, 6.0),
            rotation: Vec3::new(90.0, 0.0, 0.0),
            scale: Vec3::splat(2.0),
        },
    )?;
    Ok(())
}

/// Seconds since `last`, which is reset to now.
fn tick(last: &mut Instant) -> f32 {
    let now = Instant::now();
    let delta = now.duration_since(*last).as_secs_f32();
    *last = now;
    delta
}

#[cfg(windows)]
mod window {
    use std::{
        sync::atomic::{AtomicU64, Ordering},
        time::Instant,
    };

    use windows::{
        core::*, Win32::Foundation::*, Win32::System::LibraryLoader::*,
        Win32::UI::Input::KeyboardAndMouse::VK_ESCAPE, Win32::UI::WindowsAndMessaging::*,
    };

    use dxr_renderer::{
        hal::dx12, Error, Renderer, RendererConfig, Result, Scene,
    };

    /// Client size from the last `WM_SIZE`, `width << 32 | height`. Zero when
    /// nothing is pending.
    static PENDING_SIZE: AtomicU64 = AtomicU64::new(0);

    pub fn msg_box(msg: &str) {
        let msg: HSTRING = msg.into();
        unsafe {
            MessageBoxW(None, &msg, w!("Error"), MB_OK);
        }
    }

    extern "system" fn wndproc(
        window: HWND,
        message: u32,
        wparam: WPARAM,
        lparam: LPARAM,
    ) -> LRESULT {
        match message {
            WM_CLOSE => {
                unsafe { DestroyWindow(window) };
                LRESULT::default()
            }
            WM_DESTROY => {
                unsafe { PostQuitMessage(0) };
                LRESULT::default()
            }
            WM_KEYDOWN => {
                if wparam.0 == VK_ESCAPE.0 as usize {
                    unsafe { PostQuitMessage(0) };
                }
                LRESULT::default()
            }
            WM_SIZE => {
                let width = (lparam.0 & 0xffff) as u64;
                let height = ((lparam.0 >> 16) & 0xffff) as u64;
                PENDING_SIZE.store(width << 32 | height, Ordering::Release);
                LRESULT::default()
            }
            _ => unsafe { DefWindowProcW(window, message, wparam, lparam) },
        }
    }

    fn create_window(win_title: &str, width: u32, height: u32) -> Result<HWND> {
        let class_name = w!("DxrRendererWindowClass");

        let instance = unsafe { GetModuleHandleW(None) }
            .map_err(|err| Error::device("GetModuleHandleW", err.to_string()))?;

        let wc = WNDCLASSEXW {
            cbSize: std::mem::size_of::<WNDCLASSEXW>() as u32,
            style: CS_HREDRAW | CS_VREDRAW,
            lpfnWndProc: Some(wndproc),
            hInstance: instance,
            hCursor: unsafe { LoadCursorW(None, IDC_ARROW) }.unwrap_or_default(),
            lpszClassName: class_name,
            ..Default::default()
        };
        if unsafe { RegisterClassExW(&wc) } == 0 {
            return Err(Error::device("RegisterClassExW", "failed to register window class"));
        }

        // The requested size is the client area, grow it by the frame.
        let mut r = RECT {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        };
        unsafe { AdjustWindowRect(&mut r, WS_OVERLAPPEDWINDOW, false) };

        let w_title: HSTRING = win_title.into();
        let hwnd = unsafe {
            CreateWindowExW(
                WINDOW_EX_STYLE::default(),
                class_name,
                &w_title,
                WS_OVERLAPPEDWINDOW,
                CW_USEDEFAULT,
                CW_USEDEFAULT,
                r.right - r.left,
                r.bottom - r.top,
                None,
                None,
                instance,
                None,
            )
        };
        if hwnd.0 == 0 {
            return Err(Error::device("CreateWindowExW", "failed to create window"));
        }
        Ok(hwnd)
    }

    struct Application {
        renderer: Option<Renderer<dx12::Api>>,
        last_frame: Instant,
    }

    impl Application {
        fn new() -> Self {
            Self {
                renderer: None,
                last_frame: Instant::now(),
            }
        }

        fn on_load(&mut self, hwnd: HWND, config: &RendererConfig) -> Result<()> {
            let ctx = dx12::open(hwnd, config)?;
            let mut renderer = Renderer::new(ctx, Scene::new(), config)?;
            super::load_demo_scene(&mut renderer)?;
            self.renderer = Some(renderer);
            self.last_frame = Instant::now();
            Ok(())
        }

        fn on_frame_render(&mut self) -> Result<()> {
            let renderer = match self.renderer {
                Some(ref mut renderer) => renderer,
                None => return Ok(()),
            };
            let size = PENDING_SIZE.swap(0, Ordering::AcqRel);
            if size != 0 {
                renderer.resize((size >> 32) as u32, size as u32)?;
            }
            renderer.frame(super::tick(&mut self.last_frame))
        }

        fn on_shutdown(&mut self) -> Result<()> {
            match self.renderer.take() {
                Some(mut renderer) => renderer.shutdown(),
                None => Ok(()),
            }
        }
    }

    fn msg_loop(app: &mut Application) -> Result<()> {
        let mut message = MSG::default();
        loop {
            if unsafe { PeekMessageW(&mut message, None, 0, 0, PM_REMOVE) }.into() {
                if message.message == WM_QUIT {
                    return Ok(());
                }
                unsafe {
                    TranslateMessage(&message);
                    DispatchMessageW(&message);
                }
            } else {
                app.on_frame_render()?;
            }
        }
    }

    pub fn run(config: &RendererConfig) -> Result<()> {
        let mut app = Application::new();
        let hwnd = create_window(&config.window_title, config.window_width, config.window_height)?;

        let mut r = RECT::default();
        unsafe { GetClientRect(hwnd, &mut r) };
        let config = RendererConfig {
            window_width: (r.right - r.left) as u32,
            window_height: (r.bottom - r.top) as u32,
            ..config.clone()
        };

        let result = app
            .on_load(hwnd, &config)
            .and_then(|()| {
                unsafe { ShowWindow(hwnd, SW_SHOWNORMAL) };
                msg_loop(&mut app)
            });
        let shutdown = app.on_shutdown();
        unsafe { DestroyWindow(hwnd) };
        result.and(shutdown)
    }
}

#[cfg(windows)]
fn run(config: &RendererConfig) -> Result<()> {
    window::run(config)
}

/// Frames rendered when there is no window to present to.
#[cfg(not(windows))]
const HEADLESS_FRAMES: u32 = 120;

#[cfg(not(windows))]
fn run(config: &RendererConfig) -> Result<()> {
    use dxr_renderer::{hal::headless, Scene};

    let ctx = headless::open(config)?;
    let mut renderer = Renderer::new(ctx, Scene::new(), config)?;
    load_demo_scene(&mut renderer)?;

    let mut last_frame = Instant::now();
    for frame in 0..HEADLESS_FRAMES {
        if frame == HEADLESS_FRAMES / 2 {
            renderer
                .scene_mut()
                .set_transform(0, Transform::from_position(Vec3::new(0.5, 0.0, 4.0)));
        }
        renderer.frame(tick(&mut last_frame))?;
    }
    log::info!(
        "Rendered {} frames on the headless device ({} submissions)",
        renderer.context().surface.presented_frames(),
        renderer.context().device.submission_count()
    );
    renderer.shutdown()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let result = RendererConfig::load_or_default(config_path.as_deref()).and_then(|config| run(&config));
    if let Err(err) = result {
        log::error!("{}", err);
        #[cfg(windows)]
        window::msg_box(&err.to_string());
        process::exit(1);
    }
}
