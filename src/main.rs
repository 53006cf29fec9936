use ember::{
    error::is_fatal,
    render_target::RenderTarget,
    workers::{RecordScope, WorkerPool},
    Context, Display,
};

use winit::{
    application::ApplicationHandler,
    dpi::LogicalSize,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Window, WindowId},
};
use vulkanalia::prelude::v1_0::*;
use anyhow::Result;
use log::*;

const FRAMES_IN_FLIGHT: usize = 2;
const WORKER_COUNT: usize = 2;
const CLEAR_COLOR: [f32; 4] = [0.01, 0.01, 0.012, 1.0];

struct State {
    context: Context,
    display: Display,
    target: RenderTarget,
    workers: WorkerPool,
}

#[derive(Default)]
struct App {
    window: Option<Window>,
    state: Option<State>,
}

impl App {
    fn init(&mut self, window: Window) -> Result<()> {
        let (context, display) = Context::new(&window)?;
        let target = RenderTarget::new(
            &context,
            &display,
            FRAMES_IN_FLIGHT,
            vk::SampleCountFlags::_1,
            CLEAR_COLOR,
        )?;
        let workers = WorkerPool::new(
            &context,
            target.command_allocator(),
            WORKER_COUNT,
            FRAMES_IN_FLIGHT,
        )?;

        self.state = Some(State {
            context,
            display,
            target,
            workers,
        });
        self.window = Some(window);
        Ok(())
    }

    /// One frame: clear-only render pass, with the (empty) draw
    /// batch list still round-tripped through the worker pool.
    fn render(&mut self) -> Result<()> {
        let Some(state) = self.state.as_mut() else {
            return Ok(());
        };

        if state.display.take_resized() {
            if !state.target.recreate(&state.context, &mut state.display)? {
                return Ok(());
            }
        }
        if state.target.should_skip() {
            return Ok(());
        }

        let Some(frame) = state.target.begin_frame(&state.context)? else {
            state.target.recreate(&state.context, &mut state.display)?;
            return Ok(());
        };

        state.target.begin_render_pass(&state.context, &frame);

        let scope = RecordScope {
            render_pass: state.target.render_pass(),
            framebuffer: state.target.framebuffer(frame.image_index),
            frame_index: frame.frame_index,
        };
        state.workers.dispatch(scope, Vec::new());
        let (secondaries, batch_error) = state.workers.collect();

        state.target.execute_secondaries(&state.context, &frame, &secondaries);
        state.target.end_render_pass(&state.context, &frame);

        let stale = state.target.submit_frame(&state.context, frame)?;
        if stale {
            state.target.recreate(&state.context, &mut state.display)?;
        }

        if let Some(err) = batch_error {
            return Err(err);
        }
        Ok(())
    }

    fn destroy(&mut self) {
        if let Some(mut state) = self.state.take() {
            if let Err(err) = state.context.wait_idle() {
                error!("Device wait failed during shutdown: {}", err);
            }
            state.workers.terminate();
            state.target.terminate(&state.context);
            state.context.destroy_display(&state.display);
            state.context.destroy();
        }
        self.window = None;
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let attributes = Window::default_attributes()
            .with_title("ember")
            .with_inner_size(LogicalSize::new(1024, 576));

        match event_loop.create_window(attributes) {
            Ok(window) => {
                if let Err(err) = self.init(window) {
                    error!("Initialization failed: {:?}", err);
                    event_loop.exit();
                }
            }
            Err(err) => {
                error!("Window creation failed: {}", err);
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _: WindowId, event: WindowEvent) {
        match event {
            WindowEvent::CloseRequested => {
                self.destroy();
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                if let Some(state) = self.state.as_mut() {
                    state.display.report_extent(size.width, size.height);
                }
            }
            WindowEvent::RedrawRequested => {
                if let Err(err) = self.render() {
                    if is_fatal(&err) {
                        error!("Fatal device condition, stopping: {:?}", err);
                        self.destroy();
                        event_loop.exit();
                    } else {
                        warn!("Frame dropped: {:?}", err);
                    }
                }
            }
            _ => (),
        }
    }

    fn about_to_wait(&mut self, _: &ActiveEventLoop) {
        if let Some(window) = self.window.as_ref() {
            window.request_redraw();
        }
    }
}

fn main() -> Result<()> {
    if std::env::var_os("RUST_LOG").is_none() {
        std::env::set_var("RUST_LOG", "info");
    }
    pretty_env_logger::init();

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::default();
    event_loop.run_app(&mut app)?;
    Ok(())
}
