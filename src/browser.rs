use crate::scene::Stage;
use crate::task::ColorOption;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use js_sys::Promise;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::io::{self, Write};
use tracing::{warn, Level, Metadata};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;
use wasm_bindgen::closure::Closure;
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use wasm_bindgen_futures::JsFuture;

#[rustfmt::skip]
use web_sys::{
    Window,
    Response,
};

pub type LoopClosure = Closure<dyn FnMut(f64)>;

pub fn window() -> Result<Window> {
    web_sys::window().ok_or_else(|| anyhow!("Window not found"))
}

/// `performance.now()` in milliseconds
pub fn now() -> Result<f64> {
    Ok(window()?
        .performance()
        .ok_or_else(|| anyhow!("Performance object not found"))?
        .now())
}

pub fn create_raf_closure(f: impl FnMut(f64) + 'static) -> LoopClosure {
    Closure::wrap(Box::new(f))
}

pub fn request_animation_frame(callback: &LoopClosure) -> Result<i32> {
    window()?
        .request_animation_frame(callback.as_ref().unchecked_ref())
        .map_err(|err| anyhow!("Cannot request animation frame {:#?}", err))
}

pub fn spawn_local<F>(future: F)
where
    F: Future<Output = ()> + 'static,
{
    wasm_bindgen_futures::spawn_local(future);
}

pub async fn fetch_json<T>(json_path: &str) -> Result<T>
where
    T: DeserializeOwned,
{
    let resp_value = fetch_with_str(json_path).await?;
    let resp: Response = resp_value
        .dyn_into()
        .map_err(|element| anyhow!("error converting [{:#?}] to Response", element))?;
    if !resp.ok() {
        return Err(anyhow!("fetching {} failed with status {}", json_path, resp.status()));
    }
    let json = resp
        .json()
        .map_err(|err| anyhow!("Could not get JSON from response [{:#?}]", err))?;

    let json_value = JsFuture::from(json)
        .await
        .map_err(|err| anyhow!("error fetching [{:#?}]", err))?;

    serde_wasm_bindgen::from_value(json_value)
        .map_err(|err| anyhow!("error converting response : {:#?}", err))
}

async fn fetch_with_str(resource: &str) -> Result<JsValue> {
    let resp = window()?.fetch_with_str(resource);

    JsFuture::from(resp)
        .await
        .map_err(|err| anyhow!("error fetching : {:#?}", err))
}

// ==================== Logging ====================

/// Sends `tracing` output to the browser console, one console call per event.
pub fn init_logging(filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(filter)
        .map_err(|err| anyhow!("invalid log filter '{}' : {}", filter, err))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        // no clock on wasm32-unknown-unknown
        .without_time()
        .with_writer(ConsoleMakeWriter)
        .try_init()
        .map_err(|err| anyhow!("logging already initialized : {}", err))
}

#[derive(Clone, Copy)]
pub struct ConsoleMakeWriter;

impl<'a> MakeWriter<'a> for ConsoleMakeWriter {
    type Writer = ConsoleWriter;

    fn make_writer(&'a self) -> Self::Writer {
        ConsoleWriter::new(Level::INFO)
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        ConsoleWriter::new(*meta.level())
    }
}

/// Buffers one formatted event, flushed to the console on drop.
pub struct ConsoleWriter {
    level: Level,
    buf: Vec<u8>,
}

impl ConsoleWriter {
    fn new(level: Level) -> Self {
        ConsoleWriter {
            level,
            buf: Vec::with_capacity(256),
        }
    }
}

impl Write for ConsoleWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for ConsoleWriter {
    fn drop(&mut self) {
        if self.buf.is_empty() {
            return;
        }
        let line = JsValue::from_str(String::from_utf8_lossy(&self.buf).trim_end());
        if self.level == Level::ERROR {
            web_sys::console::error_1(&line);
        } else if self.level == Level::WARN {
            web_sys::console::warn_1(&line);
        } else if self.level > Level::INFO {
            // DEBUG and TRACE compare as "more verbose" than INFO
            web_sys::console::debug_1(&line);
        } else {
            web_sys::console::log_1(&line);
        }
    }
}

// ==================== Stage ====================

#[wasm_bindgen]
extern "C" {
    /// Scene object handed over by the page. Methods that play something may
    /// return a Promise that settles when playback ends.
    pub type JsStage;

    #[wasm_bindgen(method, js_name = showRabbit)]
    fn show_rabbit(this: &JsStage);

    #[wasm_bindgen(method, js_name = hasAnimation)]
    fn has_animation(this: &JsStage, name: &str) -> bool;

    #[wasm_bindgen(method, catch, js_name = playAnimation)]
    fn play_animation(this: &JsStage, name: &str, looped: bool) -> Result<JsValue, JsValue>;

    #[wasm_bindgen(method, catch)]
    fn say(this: &JsStage, voice: &str) -> Result<JsValue, JsValue>;

    #[wasm_bindgen(method, catch, js_name = playSound)]
    fn play_sound(this: &JsStage, sound: &str) -> Result<JsValue, JsValue>;

    #[wasm_bindgen(method, catch, js_name = showPalette)]
    fn show_palette(this: &JsStage, colors: JsValue) -> Result<JsValue, JsValue>;

    #[wasm_bindgen(method, catch, js_name = showDrawingBoard)]
    fn show_drawing_board(
        this: &JsStage,
        color_name: &str,
        target_word: &str,
    ) -> Result<JsValue, JsValue>;

    #[wasm_bindgen(method, catch, js_name = hideDrawingBoard)]
    fn hide_drawing_board(this: &JsStage) -> Result<JsValue, JsValue>;

    #[wasm_bindgen(method, catch, js_name = focusPond)]
    fn focus_pond(this: &JsStage) -> Result<JsValue, JsValue>;

    #[wasm_bindgen(method, catch, js_name = spawnFrogs)]
    fn spawn_frogs(this: &JsStage, count: u32) -> Result<JsValue, JsValue>;

    #[wasm_bindgen(method, js_name = playMusic)]
    fn play_music(this: &JsStage, name: &str);

    #[wasm_bindgen(method, js_name = pauseMusic)]
    fn pause_music(this: &JsStage);

    #[wasm_bindgen(method, js_name = resumeMusic)]
    fn resume_music(this: &JsStage);
}

/// `Stage` backed by the page's scene object.
pub struct BrowserStage {
    js: JsStage,
}

impl BrowserStage {
    pub fn new(js: JsStage) -> Self {
        BrowserStage { js }
    }
}

/// Waits for `result` if it is a Promise. Failures are logged : a broken
/// clip must not stop the lesson.
async fn settle(what: &str, result: Result<JsValue, JsValue>) {
    let value = match result {
        Ok(value) => value,
        Err(err) => {
            warn!(what = what, error = ?err, "stage call threw");
            return;
        }
    };
    if let Ok(promise) = value.dyn_into::<Promise>() {
        if let Err(err) = JsFuture::from(promise).await {
            warn!(what = what, error = ?err, "stage call rejected");
        }
    }
}

#[async_trait(?Send)]
impl Stage for BrowserStage {
    fn show_rabbit(&self) {
        self.js.show_rabbit();
    }

    fn has_animation(&self, name: &str) -> bool {
        self.js.has_animation(name)
    }

    async fn play_animation(&self, name: &str, looped: bool) {
        settle("playAnimation", self.js.play_animation(name, looped)).await;
    }

    async fn say(&self, voice: &str) {
        settle("say", self.js.say(voice)).await;
    }

    async fn play_sound(&self, sound: &str) {
        settle("playSound", self.js.play_sound(sound)).await;
    }

    async fn show_palette(&self, colors: &[ColorOption]) {
        let colors = match colors.serialize(&serde_wasm_bindgen::Serializer::json_compatible()) {
            Ok(colors) => colors,
            Err(err) => {
                warn!(%err, "could not hand palette colors to the page");
                return;
            }
        };
        settle("showPalette", self.js.show_palette(colors)).await;
    }

    async fn show_drawing_board(&self, color_name: &str, target_word: &str) {
        settle(
            "showDrawingBoard",
            self.js.show_drawing_board(color_name, target_word),
        )
        .await;
    }

    async fn hide_drawing_board(&self) {
        settle("hideDrawingBoard", self.js.hide_drawing_board()).await;
    }

    async fn focus_pond(&self) {
        settle("focusPond", self.js.focus_pond()).await;
    }

    async fn spawn_frogs(&self, count: u32) {
        settle("spawnFrogs", self.js.spawn_frogs(count)).await;
    }

    fn play_music(&self, name: &str) {
        self.js.play_music(name);
    }

    fn pause_music(&self) {
        self.js.pause_music();
    }

    fn resume_music(&self) {
        self.js.resume_music();
    }
}
