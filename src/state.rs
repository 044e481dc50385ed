// Shared state: the loaded model, its language list, and admission control
use crate::error::{Result, TranslatorError};
use crate::languages::{supported_languages, ASIAN_LANGUAGES};
use crate::models::TranslationModel;
use actix_web::web;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Generations allowed to run at once.
    pub max_in_flight: usize,
    /// Requests allowed to wait for a free slot.
    pub max_queue: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_in_flight: 1,
            max_queue: 64,
        }
    }
}

/// Bounded in-flight generations with a bounded waiting line.
pub struct Admission {
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    max_queue: usize,
}

struct WaitingGuard<'a>(&'a AtomicUsize);

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Admission {
    pub fn new(limits: Limits) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(limits.max_in_flight.max(1))),
            waiting: AtomicUsize::new(0),
            max_queue: limits.max_queue,
        }
    }

    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Waits for a generation slot, or fails with `Busy` when the line is full.
    pub async fn admit(&self) -> Result<OwnedSemaphorePermit> {
        if let Ok(permit) = self.permits.clone().try_acquire_owned() {
            return Ok(permit);
        }
        if self.waiting.fetch_add(1, Ordering::SeqCst) >= self.max_queue {
            self.waiting.fetch_sub(1, Ordering::SeqCst);
            return Err(TranslatorError::Busy);
        }
        let _guard = WaitingGuard(&self.waiting);
        self.permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|e| TranslatorError::Blocking(e.to_string()))
    }
}

/// Process-wide model host, built once at startup and dropped at shutdown.
pub struct TranslationService {
    model: Arc<dyn TranslationModel>,
    device: String,
    supported_langs: Arc<[String]>,
    admission: Admission,
}

impl TranslationService {
    pub fn new(model: Arc<dyn TranslationModel>, device: &str, limits: Limits) -> Self {
        let model_langs = model.languages();
        let supported = supported_languages(&ASIAN_LANGUAGES, &model_langs, |code| {
            model.resolves(code)
        });
        Self {
            model,
            device: device.to_string(),
            supported_langs: supported.into(),
            admission: Admission::new(limits),
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn supported_languages(&self) -> &[String] {
        &self.supported_langs
    }

    pub fn is_supported(&self, code: &str) -> bool {
        self.supported_langs.iter().any(|lang| lang == code)
    }

    pub fn admission(&self) -> &Admission {
        &self.admission
    }

    /// Runs one translation on the blocking pool once a slot is free.
    ///
    /// Callers validate the language codes first.
    pub async fn translate(
        &self,
        text: String,
        source: String,
        target: String,
        max_length: usize,
    ) -> Result<String> {
        let permit = self.admission.admit().await?;
        let model = Arc::clone(&self.model);
        web::block(move || {
            let result = model.translate(&text, &source, &target, max_length);
            drop(permit);
            result
        })
        .await
        .map_err(|e| TranslatorError::Blocking(e.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    impl TranslationModel for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn languages(&self) -> Vec<String> {
            ["de", "zh", "en", "hi"].iter().map(|c| c.to_string()).collect()
        }

        fn resolves(&self, code: &str) -> bool {
            code != "zh"
        }

        fn translate(&self, text: &str, _: &str, _: &str, _: usize) -> Result<String> {
            Ok(text.to_uppercase())
        }
    }

    #[test]
    fn supported_languages_are_computed_once_in_allowlist_order() {
        let service = TranslationService::new(Arc::new(Fixed), "cpu", Limits::default());
        assert_eq!(service.supported_languages(), &["en".to_string(), "hi".to_string()]);
        assert!(service.is_supported("hi"));
        assert!(!service.is_supported("zh"));
        assert!(!service.is_supported("de"));
    }

    #[actix_web::test]
    async fn admission_rejects_beyond_queue() {
        let admission = Admission::new(Limits {
            max_in_flight: 1,
            max_queue: 0,
        });
        let held = admission.admit().await.unwrap();
        assert!(matches!(admission.admit().await, Err(TranslatorError::Busy)));
        drop(held);
        assert!(admission.admit().await.is_ok());
    }

    #[actix_web::test]
    async fn waiting_requests_get_the_next_slot() {
        let admission = Arc::new(Admission::new(Limits {
            max_in_flight: 1,
            max_queue: 1,
        }));
        let held = admission.admit().await.unwrap();
        let waiter = {
            let admission = Arc::clone(&admission);
            actix_web::rt::spawn(async move { admission.admit().await.map(|_| ()) })
        };
        while admission.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        assert!(matches!(admission.admit().await, Err(TranslatorError::Busy)));
        drop(held);
        assert!(waiter.await.unwrap().is_ok());
        assert_eq!(admission.waiting(), 0);
        assert_eq!(admission.available(), 1);
    }

    #[actix_web::test]
    async fn translate_runs_on_blocking_pool() {
        let service = TranslationService::new(Arc::new(Fixed), "cpu", Limits::default());
        let out = service
            .translate("hello".into(), "en".into(), "hi".into(), 512)
            .await
            .unwrap();
        assert_eq!(out, "HELLO");
        assert_eq!(service.admission().available(), 1);
    }
}
