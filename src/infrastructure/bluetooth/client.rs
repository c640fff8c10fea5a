//! Watch Client
//!
//! Cloneable handle to a running [`BluetoothService`](super::BluetoothService).
//! Every call sends one command and awaits its reply.

use crate::domain::device::KnownDevice;
use crate::domain::firmware::FirmwareImage;
use crate::domain::models::{DeviceId, DiscoveredPeripheral};
use crate::infrastructure::bluetooth::blefs::{
    visible_entries, BlefsError, DirEntry, FsRequest, FsResponse,
};
use crate::infrastructure::bluetooth::connection::SessionError;
use crate::infrastructure::bluetooth::dfu::DfuError;
use crate::infrastructure::bluetooth::dispatcher::DispatchError;
use crate::infrastructure::bluetooth::payloads::{self, CurrentWeather, PlaybackStatus};
use crate::infrastructure::bluetooth::protocol::{CharacteristicRole, SETTINGS_PATH};
use crate::infrastructure::bluetooth::service::{BluetoothCommand, Reply};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Bluetooth service is not running")]
    ServiceStopped,
    #[error("no reply within {0:?}")]
    Timeout(Duration),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Filesystem(#[from] BlefsError),
    #[error(transparent)]
    Dfu(#[from] DfuError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("unexpected {0} response")]
    UnexpectedResponse(&'static str),
}

pub type ClientResult<T> = Result<T, ClientError>;

#[derive(Clone)]
pub struct WatchClient {
    commands: mpsc::UnboundedSender<BluetoothCommand>,
    timeout: Option<Duration>,
}

impl WatchClient {
    pub fn new(commands: mpsc::UnboundedSender<BluetoothCommand>) -> Self {
        Self {
            commands,
            timeout: None,
        }
    }

    /// Fails calls that take longer than `timeout`. The operation itself keeps running.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> BluetoothCommand,
    ) -> ClientResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| ClientError::ServiceStopped)?;

        match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(reply) => reply.map_err(|_| ClientError::ServiceStopped),
                Err(_) => Err(ClientError::Timeout(limit)),
            },
            None => rx.await.map_err(|_| ClientError::ServiceStopped),
        }
    }

    pub async fn start_scan(&self) -> ClientResult<()> {
        Ok(self.request(BluetoothCommand::StartScan).await??)
    }

    pub async fn scan_for_new_devices(&self) -> ClientResult<()> {
        Ok(self.request(BluetoothCommand::ScanForNewDevices).await??)
    }

    pub async fn stop_scan(&self) -> ClientResult<()> {
        Ok(self.request(BluetoothCommand::StopScan).await??)
    }

    pub fn set_pairing_new_device(&self, enabled: bool) -> ClientResult<()> {
        self.commands
            .send(BluetoothCommand::SetPairingNewDevice(enabled))
            .map_err(|_| ClientError::ServiceStopped)
    }

    pub async fn discovered(&self) -> ClientResult<Vec<DiscoveredPeripheral>> {
        self.request(BluetoothCommand::Discovered).await
    }

    pub async fn known_devices(&self) -> ClientResult<Vec<KnownDevice>> {
        self.request(BluetoothCommand::KnownDevices).await
    }

    pub async fn connect(&self, id: DeviceId) -> ClientResult<()> {
        Ok(self
            .request(|reply| BluetoothCommand::Connect(id, reply))
            .await??)
    }

    pub async fn disconnect(&self) -> ClientResult<()> {
        Ok(self.request(BluetoothCommand::Disconnect).await??)
    }

    /// Forgets `id`, or the paired watch when `None`.
    pub async fn unpair(&self, id: Option<DeviceId>) -> ClientResult<()> {
        Ok(self
            .request(|reply| BluetoothCommand::Unpair(id, reply))
            .await??)
    }

    pub async fn switch_device(&self, id: DeviceId) -> ClientResult<()> {
        Ok(self
            .request(|reply| BluetoothCommand::SwitchDevice(id, reply))
            .await??)
    }

    pub async fn is_ready(&self) -> ClientResult<bool> {
        self.request(BluetoothCommand::IsReady).await
    }

    async fn filesystem(&self, request: FsRequest) -> ClientResult<FsResponse> {
        debug!(operation = %request.kind(), "Filesystem request");
        Ok(self
            .request(|reply| BluetoothCommand::Filesystem { request, reply })
            .await??)
    }

    /// Directory entries without `.` and `..`.
    pub async fn list_dir(&self, path: &str) -> ClientResult<Vec<DirEntry>> {
        match self
            .filesystem(FsRequest::ListDir {
                path: path.to_string(),
            })
            .await?
        {
            FsResponse::Listing(entries) => Ok(visible_entries(entries)),
            _ => Err(ClientError::UnexpectedResponse("list")),
        }
    }

    pub async fn read_file(&self, path: &str) -> ClientResult<Vec<u8>> {
        match self
            .filesystem(FsRequest::ReadFile {
                path: path.to_string(),
            })
            .await?
        {
            FsResponse::Data(data) => Ok(data),
            _ => Err(ClientError::UnexpectedResponse("read")),
        }
    }

    /// Returns the free space the watch reported after the write.
    pub async fn write_file(&self, path: &str, data: Vec<u8>) -> ClientResult<u32> {
        match self
            .filesystem(FsRequest::WriteFile {
                path: path.to_string(),
                data,
            })
            .await?
        {
            FsResponse::Written { free_space, .. } => Ok(free_space),
            _ => Err(ClientError::UnexpectedResponse("write")),
        }
    }

    pub async fn delete(&self, path: &str) -> ClientResult<()> {
        self.filesystem(FsRequest::Delete {
            path: path.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn rename(&self, from: &str, to: &str) -> ClientResult<()> {
        self.filesystem(FsRequest::Rename {
            from: from.to_string(),
            to: to.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn make_dir(&self, path: &str) -> ClientResult<()> {
        self.filesystem(FsRequest::MakeDir {
            path: path.to_string(),
        })
        .await
        .map(|_| ())
    }

    pub async fn read_settings_blob(&self) -> ClientResult<Vec<u8>> {
        self.read_file(SETTINGS_PATH).await
    }

    pub async fn write_settings_blob(&self, blob: Vec<u8>) -> ClientResult<()> {
        self.write_file(SETTINGS_PATH, blob).await.map(|_| ())
    }

    /// Resolves once the watch rebooted into the new image, or the update failed.
    pub async fn update_firmware(&self, image: FirmwareImage) -> ClientResult<()> {
        Ok(self
            .request(|reply| BluetoothCommand::StartDfu { image, reply })
            .await??)
    }

    async fn write(&self, role: CharacteristicRole, payload: Vec<u8>) -> ClientResult<()> {
        Ok(self
            .request(|reply| BluetoothCommand::Write {
                role,
                payload,
                reply,
            })
            .await??)
    }

    pub async fn send_notification(&self, title: &str, body: &str) -> ClientResult<()> {
        self.write(CharacteristicRole::Notify, payloads::encode_alert(title, body))
            .await
    }

    pub async fn set_music_track(&self, track: &str, artist: &str) -> ClientResult<()> {
        self.write(CharacteristicRole::MusicTrack, track.as_bytes().to_vec())
            .await?;
        self.write(CharacteristicRole::MusicArtist, artist.as_bytes().to_vec())
            .await
    }

    pub async fn set_music_status(&self, status: PlaybackStatus) -> ClientResult<()> {
        self.write(
            CharacteristicRole::MusicStatus,
            payloads::encode_playback_status(status).to_vec(),
        )
        .await
    }

    pub async fn set_music_position(&self, position: u32, length: u32) -> ClientResult<()> {
        self.write(
            CharacteristicRole::MusicPosition,
            payloads::encode_seconds(position).to_vec(),
        )
        .await?;
        self.write(
            CharacteristicRole::MusicLength,
            payloads::encode_seconds(length).to_vec(),
        )
        .await
    }

    pub async fn set_navigation(
        &self,
        icon: &str,
        narrative: &str,
        distance: &str,
        progress: u8,
    ) -> ClientResult<()> {
        self.write(CharacteristicRole::NavigationFlags, icon.as_bytes().to_vec())
            .await?;
        self.write(
            CharacteristicRole::NavigationNarrative,
            narrative.as_bytes().to_vec(),
        )
        .await?;
        self.write(
            CharacteristicRole::NavigationDistance,
            distance.as_bytes().to_vec(),
        )
        .await?;
        self.write(
            CharacteristicRole::NavigationProgress,
            payloads::encode_navigation_progress(progress).to_vec(),
        )
        .await
    }

    pub async fn send_weather(&self, weather: &CurrentWeather) -> ClientResult<()> {
        self.write(CharacteristicRole::Weather, weather.encode()).await
    }

    pub async fn send_forecast(
        &self,
        timestamp: i64,
        days: &[payloads::ForecastDay],
    ) -> ClientResult<()> {
        self.write(
            CharacteristicRole::Weather,
            payloads::encode_forecast(timestamp, days),
        )
        .await
    }
}
