mod integration_tests {
    use crate::generator::{JobOverrides, PdfRequestOptions, ScreenshotRequestOptions};
    use crate::queue::{JobStatus, RenderQueue};
    use crate::service::RenderService;
    use crate::settings::{
        BrowserSettingsUpdate, QueueSettingsUpdate, Settings, SettingsUpdate,
        StorageSettingsUpdate,
    };
    use crate::testutil::FakeFactory;
    use crate::{decode_filename, MediaKind, RenderError};
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    fn build_service(factory: Arc<FakeFactory>, dir: &Path) -> RenderService {
        let service = RenderService::with_factory(Settings::default(), factory).unwrap();
        service
            .settings()
            .update(SettingsUpdate {
                browser: Some(BrowserSettingsUpdate {
                    acquire_timeout_ms: Some(2_000),
                    ..Default::default()
                }),
                queue: Some(QueueSettingsUpdate {
                    retry_delay_ms: Some(10),
                    ..Default::default()
                }),
                storage: Some(StorageSettingsUpdate {
                    pdf_dir: Some(dir.join("pdf")),
                    screenshot_dir: Some(dir.join("shots")),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .unwrap();
        service
    }

    async fn wait_terminal(queue: &RenderQueue, key: &str) -> crate::Job {
        for _ in 0..1000 {
            let job = queue.job_status(key).await.unwrap();
            if job.status.is_terminal() {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {key} never reached a terminal state");
    }

    #[tokio::test]
    async fn pdf_lifecycle_produces_decodable_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let service = build_service(Arc::new(FakeFactory::new()), dir.path());
        service.start();

        let admitted = service
            .pdf()
            .generate_from_html(
                "invoice-2024",
                "<html><body>invoice</body></html>".to_string(),
                PdfRequestOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(admitted.status, JobStatus::Queued);

        let job = wait_terminal(service.pdf_queue(), "invoice-2024").await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 100);

        let path = job.file_path.unwrap();
        assert!(path.starts_with(dir.path().join("pdf")));
        assert_eq!(std::fs::read(&path).unwrap(), b"%PDF-fake");

        let parsed = decode_filename(path.file_name().unwrap().to_str().unwrap()).unwrap();
        assert_eq!(parsed.requested_key, "invoice-2024");
        assert_eq!(parsed.media, MediaKind::Pdf);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn recreate_replaces_an_in_flight_job() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::with_render(
            b"%PDF-fake".to_vec(),
            Duration::from_millis(150),
        ));
        let service = build_service(factory, dir.path());
        service.start();

        service
            .pdf()
            .generate_from_html(
                "report",
                "<p>first</p>".to_string(),
                PdfRequestOptions::default(),
            )
            .await
            .unwrap();

        // Resubmitting while the first render is still running replaces it.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = service
            .pdf()
            .generate_from_html(
                "report",
                "<p>second</p>".to_string(),
                PdfRequestOptions {
                    job: JobOverrides {
                        re_create: Some(true),
                        ..Default::default()
                    },
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(second.status, JobStatus::Queued);

        let job = wait_terminal(service.pdf_queue(), "report").await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.id, second.id);

        let stats = service.pdf_queue().stats().await;
        assert_eq!(stats.totals.cancelled, 1);
        assert_eq!(stats.totals.completed, 1);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn backpressure_rejects_and_recovers_after_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::with_render(
            b"%PDF-fake".to_vec(),
            Duration::from_secs(30),
        ));
        let service = build_service(factory, dir.path());
        service
            .settings()
            .update(SettingsUpdate {
                browser: Some(BrowserSettingsUpdate {
                    max_concurrent: Some(1),
                    ..Default::default()
                }),
                queue: Some(QueueSettingsUpdate {
                    max_size: Some(2),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .unwrap();
        service.start();

        for key in ["a", "b"] {
            service
                .pdf()
                .generate_from_html(key, "<p>x</p>".to_string(), PdfRequestOptions::default())
                .await
                .unwrap();
        }

        let err = service
            .pdf()
            .generate_from_html("c", "<p>x</p>".to_string(), PdfRequestOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RenderError::QueueFull { size: 2, max: 2 }));

        // Cancelling an active job frees a queue slot immediately.
        service.pdf_queue().cancel("b").await.unwrap();
        let job = service
            .pdf()
            .generate_from_html("c", "<p>x</p>".to_string(), PdfRequestOptions::default())
            .await
            .unwrap();
        assert_eq!(job.status, JobStatus::Queued);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn busy_pdf_pool_does_not_starve_the_screenshot_queue() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::with_render(
            b"%PDF-fake".to_vec(),
            Duration::from_millis(200),
        ));
        let service = build_service(factory, dir.path());
        service
            .settings()
            .update(SettingsUpdate {
                browser: Some(BrowserSettingsUpdate {
                    max_concurrent: Some(1),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .unwrap();
        service.start();

        service
            .pdf()
            .generate_from_html("busy", "<p>x</p>".to_string(), PdfRequestOptions::default())
            .await
            .unwrap();

        // The pdf render holds its pool's only slot; the screenshot queue
        // must still dispatch on its own pool.
        tokio::time::sleep(Duration::from_millis(30)).await;
        service
            .screenshot()
            .generate_from_html(
                "shot",
                "<p>x</p>".to_string(),
                ScreenshotRequestOptions::default(),
            )
            .await
            .unwrap();

        let job = wait_terminal(service.screenshot_queue(), "shot").await;
        assert_eq!(job.status, JobStatus::Completed);
        let job = wait_terminal(service.pdf_queue(), "busy").await;
        assert_eq!(job.status, JobStatus::Completed);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn renders_continue_after_every_context_dies() {
        let dir = tempfile::tempdir().unwrap();
        let factory = Arc::new(FakeFactory::new());
        let service = build_service(factory.clone(), dir.path());
        service.start();

        service
            .screenshot()
            .generate_from_html(
                "before-crash",
                "<p>x</p>".to_string(),
                ScreenshotRequestOptions::default(),
            )
            .await
            .unwrap();
        let job = wait_terminal(service.screenshot_queue(), "before-crash").await;
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(factory.created(), 1);

        factory.kill_all();

        service
            .screenshot()
            .generate_from_html(
                "after-crash",
                "<p>x</p>".to_string(),
                ScreenshotRequestOptions::default(),
            )
            .await
            .unwrap();
        let job = wait_terminal(service.screenshot_queue(), "after-crash").await;
        assert_eq!(job.status, JobStatus::Completed);

        // The dead idle context was discarded on reuse and replaced lazily.
        assert_eq!(factory.created(), 2);

        service.shutdown().await;
    }

    #[tokio::test]
    async fn storage_directory_change_applies_to_new_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let service = build_service(Arc::new(FakeFactory::new()), dir.path());
        service.start();

        service
            .pdf()
            .generate_from_html("first", "<p>x</p>".to_string(), PdfRequestOptions::default())
            .await
            .unwrap();
        let job = wait_terminal(service.pdf_queue(), "first").await;
        assert!(job.file_path.unwrap().starts_with(dir.path().join("pdf")));

        service
            .settings()
            .update(SettingsUpdate {
                storage: Some(StorageSettingsUpdate {
                    pdf_dir: Some(dir.path().join("relocated")),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .unwrap();

        service
            .pdf()
            .generate_from_html("second", "<p>x</p>".to_string(), PdfRequestOptions::default())
            .await
            .unwrap();
        let job = wait_terminal(service.pdf_queue(), "second").await;
        assert!(job
            .file_path
            .unwrap()
            .starts_with(dir.path().join("relocated")));

        service.shutdown().await;
    }

    #[tokio::test]
    async fn screenshot_jpeg_artifact_uses_jpg_extension() {
        let dir = tempfile::tempdir().unwrap();
        let service = build_service(Arc::new(FakeFactory::new()), dir.path());
        service.start();

        service
            .screenshot()
            .generate_from_html(
                "hero",
                "<p>x</p>".to_string(),
                ScreenshotRequestOptions {
                    kind: Some(crate::ImageKind::Jpeg),
                    quality: Some(80),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let job = wait_terminal(service.screenshot_queue(), "hero").await;
        assert_eq!(job.status, JobStatus::Completed);
        let path = job.file_path.unwrap();
        assert_eq!(path.extension().unwrap(), "jpg");
        assert!(path.starts_with(dir.path().join("shots")));

        service.shutdown().await;
    }
}
