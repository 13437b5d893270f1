//! End-to-end workflow execution against a scripted in-memory device.
//!
//! The scripted device renders a tiny three-screen app (launcher, home,
//! chat) as synthetic images; reference crops of its widgets are written
//! into a temporary asset directory so the pixel locator stages resolve
//! them exactly. No adb, no network.

use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use image::{GrayImage, Luma};

use droidpilot::apps::wechat::WeChatHandler;
use droidpilot::apps::{AppHandler, ExecutorServices};
use droidpilot::classifier::{parse_fixed_form, ParsedTask, TaskClassifier};
use droidpilot::config::{ClassifierConfig, ClassifierMode, ScreenshotWaits, WorkflowBudgets};
use droidpilot::device::{DeviceSurface, ScreenInsets, Screenshot};
use droidpilot::errors::AgentResult;
use droidpilot::locator::HybridLocator;
use droidpilot::registry::{ModuleInfo, ModuleRecord};

const W: u32 = 240;
const H: u32 = 320;
const TILE: u32 = 24;

// Widget positions on the scripted screens.
const HOME_TAB: (u32, u32) = (108, 280);
const CONTACT_ROW: (u32, u32) = (20, 60);
const CHAT_INPUT: (u32, u32) = (20, 280);
const SEND_BUTTON: (u32, u32) = (190, 280);
const BACK_BUTTON: (u32, u32) = (8, 8);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AppScreen {
    Launcher,
    Home,
    Chat,
}

/// Deterministic textured tile; distinct seeds give distinct widgets.
fn tile(seed: u64) -> GrayImage {
    let mut state = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    let mut next = move || {
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        state.wrapping_mul(0x2545_F491_4F6C_DD1D)
    };
    let mut img = GrayImage::new(TILE, TILE);
    for by in 0..(TILE / 4) {
        for bx in 0..(TILE / 4) {
            let v = (next() % 200 + 30) as u8;
            for y in 0..4 {
                for x in 0..4 {
                    img.put_pixel(bx * 4 + x, by * 4 + y, Luma([v]));
                }
            }
        }
    }
    img
}

fn tile_home_tab() -> GrayImage {
    tile(11)
}
fn tile_contact() -> GrayImage {
    tile(22)
}
fn tile_chat_input() -> GrayImage {
    tile(33)
}
fn tile_send() -> GrayImage {
    tile(44)
}
fn tile_back() -> GrayImage {
    tile(55)
}

fn png_of(img: &GrayImage) -> Vec<u8> {
    let mut out = Vec::new();
    image::DynamicImage::ImageLuma8(img.clone())
        .write_to(&mut Cursor::new(&mut out), image::ImageFormat::Png)
        .unwrap();
    out
}

fn in_tile(x: u32, y: u32, at: (u32, u32)) -> bool {
    x >= at.0 && x < at.0 + TILE && y >= at.1 && y < at.1 + TILE
}

struct ScriptedDevice {
    state: Mutex<AppScreen>,
    foreground: Mutex<Option<String>>,
    screenshots: AtomicUsize,
    typed: Mutex<Vec<String>>,
    send_taps: AtomicUsize,
    has_send_button: bool,
}

impl ScriptedDevice {
    fn new(has_send_button: bool) -> Self {
        Self {
            state: Mutex::new(AppScreen::Launcher),
            foreground: Mutex::new(None),
            screenshots: AtomicUsize::new(0),
            typed: Mutex::new(Vec::new()),
            send_taps: AtomicUsize::new(0),
            has_send_button,
        }
    }

    fn screen(&self) -> AppScreen {
        *self.state.lock().unwrap()
    }

    fn render(&self) -> GrayImage {
        let state = self.screen();
        let mut canvas = GrayImage::from_pixel(
            W,
            H,
            Luma([match state {
                AppScreen::Launcher => 30,
                AppScreen::Home => 50,
                AppScreen::Chat => 70,
            }]),
        );
        let mut blit = |img: &GrayImage, at: (u32, u32)| {
            image::imageops::overlay(&mut canvas, img, at.0 as i64, at.1 as i64);
        };
        match state {
            AppScreen::Launcher => {}
            AppScreen::Home => {
                blit(&tile_home_tab(), HOME_TAB);
                blit(&tile_contact(), CONTACT_ROW);
            }
            AppScreen::Chat => {
                blit(&tile_chat_input(), CHAT_INPUT);
                blit(&tile_back(), BACK_BUTTON);
                if self.has_send_button {
                    blit(&tile_send(), SEND_BUTTON);
                }
            }
        }
        canvas
    }
}

#[async_trait]
impl DeviceSurface for ScriptedDevice {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn connect(&self) -> AgentResult<bool> {
        Ok(true)
    }

    async fn is_connected(&self) -> AgentResult<bool> {
        Ok(true)
    }

    async fn screen_size(&self) -> AgentResult<(u32, u32)> {
        Ok((W, H))
    }

    async fn screen_insets(&self) -> AgentResult<ScreenInsets> {
        Ok(ScreenInsets::default())
    }

    async fn tap(&self, x: u32, y: u32) -> AgentResult<()> {
        let mut state = self.state.lock().unwrap();
        match *state {
            AppScreen::Home if in_tile(x, y, CONTACT_ROW) => *state = AppScreen::Chat,
            AppScreen::Chat if in_tile(x, y, BACK_BUTTON) => *state = AppScreen::Home,
            AppScreen::Chat if in_tile(x, y, SEND_BUTTON) => {
                self.send_taps.fetch_add(1, Ordering::SeqCst);
            }
            _ => {}
        }
        Ok(())
    }

    async fn long_press(&self, _x: u32, _y: u32, _duration_ms: u64) -> AgentResult<()> {
        Ok(())
    }

    async fn swipe(&self, _: u32, _: u32, _: u32, _: u32, _: u64) -> AgentResult<()> {
        Ok(())
    }

    async fn input_text(&self, text: &str) -> AgentResult<()> {
        self.typed.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn input_text_wide(&self, text: &str) -> AgentResult<()> {
        self.typed.lock().unwrap().push(text.to_string());
        Ok(())
    }

    async fn clear_text_field(&self) -> AgentResult<()> {
        Ok(())
    }

    async fn key_event(&self, key: u32) -> AgentResult<()> {
        if key == droidpilot::device::keycode::BACK {
            let mut state = self.state.lock().unwrap();
            *state = match *state {
                AppScreen::Chat => AppScreen::Home,
                AppScreen::Home => AppScreen::Launcher,
                AppScreen::Launcher => AppScreen::Launcher,
            };
        }
        Ok(())
    }

    async fn launch_app(&self, package: &str, _activity: Option<&str>) -> AgentResult<()> {
        *self.state.lock().unwrap() = AppScreen::Home;
        *self.foreground.lock().unwrap() = Some(package.to_string());
        Ok(())
    }

    async fn stop_app(&self, _package: &str) -> AgentResult<()> {
        Ok(())
    }

    async fn foreground_app(&self) -> AgentResult<Option<String>> {
        Ok(self.foreground.lock().unwrap().clone())
    }

    async fn open_url(&self, _url: &str) -> AgentResult<()> {
        Ok(())
    }

    async fn call(&self, _number: &str) -> AgentResult<()> {
        Ok(())
    }

    async fn screenshot(&self) -> AgentResult<Screenshot> {
        self.screenshots.fetch_add(1, Ordering::SeqCst);
        Ok(Screenshot {
            png: png_of(&self.render()),
            width: W,
            height: H,
            crop_top: 0,
        })
    }

    async fn screenshot_full(&self) -> AgentResult<Vec<u8>> {
        self.screenshots.fetch_add(1, Ordering::SeqCst);
        Ok(png_of(&self.render()))
    }
}

/// Asset fixture: reference crops of the scripted widgets.
fn write_assets(dir: &Path) {
    let images = dir.join("images");
    std::fs::create_dir_all(images.join("contacts")).unwrap();
    std::fs::create_dir_all(images.join("system")).unwrap();

    let save = |img: &GrayImage, rel: &str| {
        image::DynamicImage::ImageLuma8(img.clone())
            .save(images.join(rel))
            .unwrap();
    };
    save(&tile_home_tab(), "wechat_home.png");
    save(&tile_home_tab(), "wechat_home_button.png");
    save(&tile_back(), "wechat_back.png");
    save(&tile_chat_input(), "wechat_chat_input.png");
    save(&tile_send(), "wechat_chat_send.png");
    save(&tile_contact(), "contacts/zhangsan.png");
    std::fs::write(
        images.join("aliases.yaml"),
        "aliases:\n  张三: contacts/zhangsan\n",
    )
    .unwrap();
}

fn fixture_handler(dir: &Path) -> WeChatHandler {
    write_assets(dir);
    WeChatHandler::new(ModuleRecord {
        id: "wechat".into(),
        info: ModuleInfo {
            name: "微信".into(),
            package_id: Some("com.tencent.mm".into()),
            keywords: vec!["微信".into(), "消息".into()],
            description: "test".into(),
        },
        dir: dir.to_path_buf(),
        templates: Vec::new(),
    })
}

struct Fixture {
    _dir: tempfile::TempDir,
    handler: WeChatHandler,
    locator: HybridLocator,
    classifier: TaskClassifier,
    budgets: WorkflowBudgets,
    waits: ScreenshotWaits,
    cancel: std::sync::atomic::AtomicBool,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let handler = fixture_handler(dir.path());
        Self {
            _dir: dir,
            handler,
            locator: HybridLocator::offline(),
            classifier: TaskClassifier::new(
                &ClassifierConfig {
                    mode: ClassifierMode::Regex,
                    secondary: None,
                },
                None,
            ),
            budgets: WorkflowBudgets::default(),
            waits: ScreenshotWaits::fixed(0),
            cancel: std::sync::atomic::AtomicBool::new(false),
        }
    }

    fn services<'a>(&'a self, device: &'a ScriptedDevice) -> ExecutorServices<'a> {
        ExecutorServices {
            device,
            locator: &self.locator,
            replanner: None,
            classifier: &self.classifier,
            budgets: &self.budgets,
            waits: &self.waits,
            operation_delay_ms: 0,
            cancel: &self.cancel,
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fixed_form_send_message_runs_and_resets_to_home() {
    let fixture = Fixture::new();
    let device = ScriptedDevice::new(true);

    let form = parse_fixed_form("ss:张三:你好").unwrap();
    let outcome = fixture
        .handler
        .execute_task(&fixture.services(&device), "ss:张三:你好", Some(&form.parsed))
        .await
        .unwrap();

    assert!(outcome.success, "outcome: {}", outcome.message);
    // The message was typed and the send button tapped once.
    assert_eq!(device.typed.lock().unwrap().as_slice(), ["你好"]);
    assert_eq!(device.send_taps.load(Ordering::SeqCst), 1);
    // Mandatory reset: the device ends on the app home screen.
    assert_eq!(device.screen(), AppScreen::Home);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_send_button_fails_step_but_still_resets() {
    let fixture = Fixture::new();
    let device = ScriptedDevice::new(false);

    let parsed = ParsedTask::SendMessage {
        recipient: "张三".into(),
        content: "你好".into(),
    };
    let outcome = fixture
        .handler
        .execute_task(&fixture.services(&device), "给张三发消息说你好", Some(&parsed))
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some("step_failed"));
    // Reset ran regardless of the failure.
    assert_eq!(device.screen(), AppScreen::Home);
    // The text had been typed before the send step failed.
    assert!(!device.typed.lock().unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_params_do_not_touch_the_device() {
    let fixture = Fixture::new();
    let device = ScriptedDevice::new(true);

    let parsed = ParsedTask::SendMessage {
        recipient: String::new(),
        content: "你好".into(),
    };
    let outcome = fixture
        .handler
        .execute_task(&fixture.services(&device), "发消息", Some(&parsed))
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.missing_params, vec!["contact".to_string()]);
    assert_eq!(device.screenshots.load(Ordering::SeqCst), 0);
    assert_eq!(device.screen(), AppScreen::Launcher);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn fire_and_forget_batch_captures_no_screenshots() {
    use droidpilot::workflow::executor::WorkflowExecutor;
    use droidpilot::workflow::{NavStep, Params, ScreenState, Workflow};

    let fixture = Fixture::new();

    let run_with_steps = |steps: Vec<NavStep>| {
        let fixture = &fixture;
        async move {
            let device = ScriptedDevice::new(true);
            let workflow = Workflow {
                name: "batch_probe",
                description: "deterministic steps only",
                valid_start_screens: vec![ScreenState::Home],
                nav_to_start: Vec::new(),
                steps,
                end_screen: ScreenState::Home,
                required_params: Vec::new(),
                optional_params: Params::new(),
            };
            let executor = WorkflowExecutor::new(
                &device,
                &fixture.locator,
                None,
                &fixture.handler,
                &fixture.budgets,
                &fixture.waits,
                0,
                &fixture.cancel,
            );
            executor
                .execute_workflow(&workflow, &Params::new(), "probe")
                .await
                .unwrap();
            device.screenshots.load(Ordering::SeqCst)
        }
    };

    let baseline = run_with_steps(Vec::new()).await;
    let with_batch = run_with_steps(vec![
        NavStep::wait(1, "wait a moment"),
        NavStep::press_key(66, "press enter"),
        NavStep::wait(1, "wait again"),
    ])
    .await;

    // Deterministic steps run back-to-back: the batch adds zero captures
    // over the preset/reset baseline.
    assert_eq!(with_batch, baseline);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_parsed_record_never_invokes_the_executor() {
    let fixture = Fixture::new();
    let device = ScriptedDevice::new(true);

    let outcome = fixture
        .handler
        .execute_task(&fixture.services(&device), "aaa", Some(&ParsedTask::Invalid))
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.error_kind, Some("invalid_input"));
    assert!(outcome.message.contains("ss:"));
    assert_eq!(device.screenshots.load(Ordering::SeqCst), 0);
}
